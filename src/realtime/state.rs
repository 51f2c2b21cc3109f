//! In-memory live view folded from push events.
//!
//! Register totals can be bumped locally when a sale arrives before the
//! server's own register update. Those bumps are provisional: the next
//! update that carries `today_sales_total`, or the next snapshot, replaces
//! the total outright. Updates older than the known `version` are dropped.

use std::collections::{HashMap, VecDeque};

use super::model::{RegisterState, RegisterStatus, RegisterUpdate, SalePreview};

pub const DEFAULT_FEED_CAPACITY: usize = 50;

#[derive(Debug, Clone, PartialEq)]
struct RegisterEntry {
    state: RegisterState,
    /// Sum of local sale increments not yet confirmed by the server.
    provisional_total: f64,
}

/// Result of applying a `register.updated` event.
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterEffect {
    Applied {
        /// Set when the update moved the register into `locked_by_admin`
        /// from any other status (or created it locked).
        locked: bool,
        register_id: String,
        name: String,
    },
    /// Older than the revision already held.
    Stale,
}

#[derive(Debug)]
pub struct LiveState {
    registers: HashMap<String, RegisterEntry>,
    feed: VecDeque<SalePreview>,
    capacity: usize,
}

impl Default for LiveState {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

fn is_stale(known: Option<u64>, incoming: Option<u64>) -> bool {
    matches!((known, incoming), (Some(known), Some(incoming)) if incoming < known)
}

impl LiveState {
    pub fn new(capacity: usize) -> Self {
        Self {
            registers: HashMap::new(),
            feed: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn apply_register_update(&mut self, update: RegisterUpdate) -> RegisterEffect {
        let locking = update.status == Some(RegisterStatus::LockedByAdmin);
        let authoritative_total = update.today_sales_total.is_some();

        if let Some(entry) = self.registers.get_mut(&update.id) {
            if is_stale(entry.state.version, update.version) {
                return RegisterEffect::Stale;
            }
            let locked = locking && entry.state.status != RegisterStatus::LockedByAdmin;
            update.merge_into(&mut entry.state);
            if authoritative_total {
                entry.provisional_total = 0.0;
            }
            return RegisterEffect::Applied {
                locked,
                register_id: entry.state.id.clone(),
                name: entry.state.name.clone(),
            };
        }

        let state = update.into_new_state();
        let effect = RegisterEffect::Applied {
            locked: locking,
            register_id: state.id.clone(),
            name: state.name.clone(),
        };
        self.registers.insert(
            state.id.clone(),
            RegisterEntry {
                state,
                provisional_total: 0.0,
            },
        );
        effect
    }

    /// Returns `true` when a known register's total was bumped.
    pub fn apply_sale_completed(&mut self, sale: SalePreview) -> bool {
        let bumped = match self.registers.get_mut(&sale.register_id) {
            Some(entry) => {
                let current = entry.state.today_sales_total.unwrap_or(0.0);
                entry.state.today_sales_total = Some(current + sale.total);
                entry.provisional_total += sale.total;
                true
            }
            None => false,
        };

        self.feed.push_front(sale);
        self.feed.truncate(self.capacity);
        bumped
    }

    /// Replace entries with an authoritative register list.
    ///
    /// Entries absent from the snapshot are kept. Returns how many entries
    /// were replaced.
    pub fn apply_snapshot(&mut self, registers: Vec<RegisterState>) -> usize {
        let mut replaced = 0;
        for state in registers {
            if let Some(existing) = self.registers.get(&state.id) {
                if is_stale(existing.state.version, state.version) {
                    continue;
                }
            }
            self.registers.insert(
                state.id.clone(),
                RegisterEntry {
                    state,
                    provisional_total: 0.0,
                },
            );
            replaced += 1;
        }
        replaced
    }

    pub fn register(&self, id: &str) -> Option<&RegisterState> {
        self.registers.get(id).map(|e| &e.state)
    }

    pub fn provisional_total(&self, id: &str) -> Option<f64> {
        self.registers.get(id).map(|e| e.provisional_total)
    }

    /// All registers, ordered by name then id.
    pub fn registers(&self) -> Vec<RegisterState> {
        let mut out: Vec<RegisterState> =
            self.registers.values().map(|e| e.state.clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Newest first.
    pub fn feed(&self) -> Vec<SalePreview> {
        self.feed.iter().cloned().collect()
    }

    pub fn feed_len(&self) -> usize {
        self.feed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update(value: serde_json::Value) -> RegisterUpdate {
        serde_json::from_value(value).expect("register update")
    }

    fn sale(id: usize, register_id: &str, total: f64) -> SalePreview {
        SalePreview {
            id: format!("s{id}"),
            total,
            items_count: 1,
            created_at: format!("2026-10-19T12:{:02}:00Z", id % 60),
            branch_id: "b1".into(),
            register_id: register_id.into(),
            cashier_name: None,
        }
    }

    fn seeded() -> LiveState {
        let mut live = LiveState::default();
        live.apply_register_update(update(json!({
            "id": "r1",
            "name": "Front counter",
            "status": "active",
            "current_cashier": "Maya",
            "today_sales_total": 100.0,
            "version": 3
        })));
        live
    }

    #[test]
    fn test_feed_keeps_newest_fifty() {
        let mut live = LiveState::default();
        for i in 0..60 {
            live.apply_sale_completed(sale(i, "unknown", 1.0));
        }
        let feed = live.feed();
        assert_eq!(feed.len(), 50);
        assert_eq!(feed[0].id, "s59");
        assert_eq!(feed[49].id, "s10");
    }

    #[test]
    fn test_partial_update_preserves_other_fields() {
        let mut live = seeded();
        live.apply_register_update(update(json!({ "id": "r1", "status": "shift_closed" })));

        let r1 = live.register("r1").unwrap();
        assert_eq!(r1.status, RegisterStatus::ShiftClosed);
        assert_eq!(r1.current_cashier.as_deref(), Some("Maya"));
        assert_eq!(r1.today_sales_total, Some(100.0));
        assert_eq!(r1.name, "Front counter");
    }

    #[test]
    fn test_explicit_null_clears_field() {
        let mut live = seeded();
        live.apply_register_update(update(json!({ "id": "r1", "current_cashier": null })));
        assert_eq!(live.register("r1").unwrap().current_cashier, None);
    }

    #[test]
    fn test_lock_reported_and_sales_still_increment() {
        let mut live = seeded();
        let effect = live.apply_register_update(update(json!({
            "id": "r1",
            "status": "locked_by_admin"
        })));
        assert_eq!(
            effect,
            RegisterEffect::Applied {
                locked: true,
                register_id: "r1".into(),
                name: "Front counter".into(),
            }
        );

        // Repeating the status is not a new lock.
        let again = live.apply_register_update(update(json!({
            "id": "r1",
            "status": "locked_by_admin",
            "current_cashier": null
        })));
        assert!(matches!(again, RegisterEffect::Applied { locked: false, .. }));

        assert!(live.apply_sale_completed(sale(1, "r1", 12.5)));
        assert!(live.apply_sale_completed(sale(2, "r1", 7.5)));
        let r1 = live.register("r1").unwrap();
        assert_eq!(r1.status, RegisterStatus::LockedByAdmin);
        assert_eq!(r1.today_sales_total, Some(120.0));
        assert_eq!(live.provisional_total("r1"), Some(20.0));
    }

    #[test]
    fn test_sale_for_unknown_register_only_feeds() {
        let mut live = seeded();
        assert!(!live.apply_sale_completed(sale(1, "r404", 5.0)));
        assert!(live.register("r404").is_none());
        assert_eq!(live.feed_len(), 1);
    }

    #[test]
    fn test_authoritative_total_replaces_provisional() {
        let mut live = seeded();
        live.apply_sale_completed(sale(1, "r1", 10.0));

        // Update without a total keeps the provisional bump.
        live.apply_register_update(update(json!({ "id": "r1", "status": "active", "version": 4 })));
        assert_eq!(live.register("r1").unwrap().today_sales_total, Some(110.0));
        assert_eq!(live.provisional_total("r1"), Some(10.0));

        // Server total already includes the sale.
        live.apply_register_update(update(json!({
            "id": "r1",
            "today_sales_total": 110.0,
            "version": 5
        })));
        assert_eq!(live.register("r1").unwrap().today_sales_total, Some(110.0));
        assert_eq!(live.provisional_total("r1"), Some(0.0));
    }

    #[test]
    fn test_stale_update_is_dropped() {
        let mut live = seeded();
        let effect = live.apply_register_update(update(json!({
            "id": "r1",
            "status": "offline",
            "version": 2
        })));
        assert_eq!(effect, RegisterEffect::Stale);
        assert_eq!(live.register("r1").unwrap().status, RegisterStatus::Active);

        // Unversioned updates are always applied.
        live.apply_register_update(update(json!({ "id": "r1", "status": "offline" })));
        assert_eq!(live.register("r1").unwrap().status, RegisterStatus::Offline);
        assert_eq!(live.register("r1").unwrap().version, Some(3));
    }

    #[test]
    fn test_snapshot_replaces_and_respects_versions() {
        let mut live = seeded();
        live.apply_sale_completed(sale(1, "r1", 10.0));

        let replaced = live.apply_snapshot(vec![
            RegisterState {
                id: "r1".into(),
                name: "Front counter".into(),
                branch_id: Some("b1".into()),
                status: RegisterStatus::Active,
                current_cashier: Some("Maya".into()),
                shift_duration: None,
                today_sales_total: Some(130.0),
                version: Some(6),
                updated_at: None,
            },
            RegisterState {
                id: "r2".into(),
                name: "Bar".into(),
                branch_id: None,
                status: RegisterStatus::Offline,
                current_cashier: None,
                shift_duration: None,
                today_sales_total: None,
                version: None,
                updated_at: None,
            },
        ]);
        assert_eq!(replaced, 2);
        assert_eq!(live.register("r1").unwrap().today_sales_total, Some(130.0));
        assert_eq!(live.provisional_total("r1"), Some(0.0));

        let names: Vec<String> = live.registers().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["Bar".to_string(), "Front counter".to_string()]);

        let older = RegisterState {
            version: Some(1),
            status: RegisterStatus::Offline,
            ..live.register("r1").unwrap().clone()
        };
        assert_eq!(live.apply_snapshot(vec![older]), 0);
        assert_eq!(live.register("r1").unwrap().status, RegisterStatus::Active);
    }
}
