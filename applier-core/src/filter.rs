use applier_net::{Marker, Tick};

use crate::config::{Config, RestrictType};
use crate::registry::TransactionRegistry;

/// Decides whether a marker should be dropped before it ever reaches the
/// apply engine. Rules are checked in order; the first one that applies
/// wins.
pub fn should_skip(
    marker: &Marker,
    first_regular_tick: Tick,
    config: &Config,
    registry: &TransactionRegistry,
) -> bool {
    // Rule 1: markers below the server's first regular tick only matter if
    // they belong to a transaction already bridged in from the
    // open-transactions handshake (or are themselves transaction control
    // for one). Everything else that old is noise from before this
    // follower's horizon.
    if marker.tick() < first_regular_tick {
        let belongs_to_open_txn = marker
            .transaction_id()
            .map(|tid| registry.contains(tid))
            .unwrap_or(false);
        if !belongs_to_open_txn {
            return true;
        }
    }

    // Rule 2: system collections (leading underscore) are dropped unless
    // explicitly included. Transaction control and DDL markers don't carry
    // a collection name here and pass through to rule 3/4.
    if !config.include_system {
        if let Some(name) = marker.collection_name() {
            if name.starts_with('_') {
                return true;
            }
        }
    }

    // Rule 3: explicit include/exclude collection restriction, by name.
    match config.restrict_type {
        RestrictType::None => {}
        RestrictType::Include => {
            if let Some(name) = marker.collection_name() {
                if !config.restrict_collections.contains(name) {
                    return true;
                }
            }
        }
        RestrictType::Exclude => {
            if let Some(name) = marker.collection_name() {
                if config.restrict_collections.contains(name) {
                    return true;
                }
            }
        }
    }

    false
}

#[cfg(test)]
mod test {
    use super::*;
    use applier_net::{CollectionId, TransactionId};
    use serde_json::Value;
    use test_log::test;

    fn insert(tick: u64, cname: &str, tid: Option<TransactionId>) -> Marker {
        Marker::DocInsert {
            tick: Tick(tick),
            tid,
            cid: CollectionId(1),
            cname: Some(cname.to_owned()),
            key: "a".into(),
            rev: 1,
            data: Value::Null,
            is_edge: false,
        }
    }

    #[test]
    fn below_first_regular_is_skipped_unless_bridged() {
        let config = Config::default();
        let registry = TransactionRegistry::new();
        let marker = insert(5, "things", None);
        assert!(should_skip(&marker, Tick(10), &config, &registry));

        let mut registry = TransactionRegistry::new();
        registry.seed_placeholder(TransactionId(9));
        let marker = insert(5, "things", Some(TransactionId(9)));
        assert!(!should_skip(&marker, Tick(10), &config, &registry));
    }

    #[test]
    fn system_collections_skipped_by_default() {
        let config = Config::default();
        let registry = TransactionRegistry::new();
        let marker = insert(100, "_users", None);
        assert!(should_skip(&marker, Tick(0), &config, &registry));

        let mut config = Config::default();
        config.include_system = true;
        assert!(!should_skip(&marker, Tick(0), &config, &registry));
    }

    #[test]
    fn include_restriction_only_keeps_listed_collections() {
        let mut config = Config::default();
        config.restrict_type = RestrictType::Include;
        config.restrict_collections.insert("things".into());
        let registry = TransactionRegistry::new();

        assert!(!should_skip(&insert(100, "things", None), Tick(0), &config, &registry));
        assert!(should_skip(&insert(100, "others", None), Tick(0), &config, &registry));
    }

    #[test]
    fn exclude_restriction_drops_listed_collections() {
        let mut config = Config::default();
        config.restrict_type = RestrictType::Exclude;
        config.restrict_collections.insert("noisy".into());
        let registry = TransactionRegistry::new();

        assert!(should_skip(&insert(100, "noisy", None), Tick(0), &config, &registry));
        assert!(!should_skip(&insert(100, "things", None), Tick(0), &config, &registry));
    }

    #[test]
    fn transaction_control_markers_have_no_collection_name() {
        let config = Config::default();
        let registry = TransactionRegistry::new();
        let marker = Marker::TxnCommit {
            tick: Tick(100),
            tid: TransactionId(1),
        };
        assert!(!should_skip(&marker, Tick(0), &config, &registry));
    }
}
