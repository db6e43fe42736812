//! Coordinator Module Tests
//!
//! ## Test Scopes
//! - **Registration**: idempotent upsert, leader replacement, concurrent retries.
//! - **Tables & rules**: idempotent creation, explicit and lazy binding.
//! - **Routing**: stability, compound keys, liveness.

#[cfg(test)]
mod tests {
    use crate::coordinator::protocol::RegisterShardRequest;
    use crate::coordinator::registry::ShardRegistry;
    use crate::coordinator::router::storage_key;
    use crate::coordinator::types::{PartitionRule, ShardHealth};
    use crate::error::KvError;
    use crate::shard::types::Role;
    use std::sync::Arc;
    use std::time::Duration;

    fn leader(shard_id: &str, address: &str) -> RegisterShardRequest {
        RegisterShardRequest {
            shard_id: shard_id.to_string(),
            role: Role::Leader,
            address: address.to_string(),
            leader_address: None,
        }
    }

    fn follower(shard_id: &str, address: &str, leader_address: &str) -> RegisterShardRequest {
        RegisterShardRequest {
            shard_id: shard_id.to_string(),
            role: Role::Follower,
            address: address.to_string(),
            leader_address: Some(leader_address.to_string()),
        }
    }

    fn registry() -> ShardRegistry {
        ShardRegistry::new(Duration::from_secs(15))
    }

    // ============================================================
    // REGISTRATION
    // ============================================================

    #[test]
    fn test_repeated_registration_is_idempotent() {
        let registry = registry();
        registry.register_shard(leader("shard-1", "http://a:8000"));
        registry.register_shard(follower("shard-1", "http://b:8000", "http://a:8000"));
        registry.register_shard(leader("shard-1", "http://a:8000/"));
        registry.register_shard(follower("shard-1", "http://b:8000", "http://a:8000"));

        let groups = registry.groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].leader.as_ref().unwrap().address, "http://a:8000");
        assert_eq!(groups[0].followers.len(), 1);
        assert_eq!(groups[0].followers[0].address, "http://b:8000");
    }

    #[test]
    fn test_new_leader_address_replaces_old() {
        let registry = registry();
        registry.register_shard(leader("shard-1", "http://a:8000"));
        registry.register_shard(leader("shard-1", "http://c:8000"));

        let groups = registry.groups();
        assert_eq!(groups[0].leader.as_ref().unwrap().address, "http://c:8000");
    }

    #[test]
    fn test_url_alias_is_accepted() {
        let req: RegisterShardRequest = serde_json::from_str(
            r#"{"shard_id":"shard-1","url":"http://a:8000","role":"leader"}"#,
        )
        .unwrap();
        assert_eq!(req.address, "http://a:8000");
        assert_eq!(req.role, Role::Leader);
    }

    #[test]
    fn test_concurrent_registrations_never_tear() {
        let registry = Arc::new(registry());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        registry.register_shard(leader("shard-1", "http://a:8000"));
                        registry.register_shard(follower(
                            "shard-1",
                            &format!("http://f{}:8000", i % 4),
                            "http://a:8000",
                        ));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let groups = registry.groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].leader.as_ref().unwrap().address, "http://a:8000");
        assert_eq!(groups[0].followers.len(), 4);
    }

    // ============================================================
    // TABLES & RULES
    // ============================================================

    #[test]
    fn test_create_table_is_idempotent() {
        let registry = registry();
        registry.register_shard(leader("shard-1", "http://a:8000"));

        assert!(registry.create_table("usertable", None).unwrap());
        assert!(!registry.create_table("usertable", None).unwrap());
        assert_eq!(registry.tables().len(), 1);
        assert!(matches!(
            registry.create_table("", None),
            Err(KvError::MalformedRequest(_))
        ));
    }

    #[test]
    fn test_rule_is_fixed_at_creation() {
        let registry = registry();
        registry.register_shard(leader("shard-2", "http://b:8000"));
        registry.register_shard(leader("shard-1", "http://a:8000"));
        registry.create_table("usertable", None).unwrap();

        // Groups registered later do not join an existing table.
        registry.register_shard(leader("shard-3", "http://c:8000"));

        let table = registry.table("usertable").unwrap();
        assert_eq!(
            table.rule,
            Some(PartitionRule::Hash {
                shard_ids: vec!["shard-1".to_string(), "shard-2".to_string()]
            })
        );
    }

    #[test]
    fn test_rule_binds_lazily_when_created_before_shards() {
        let registry = registry();
        registry.create_table("usertable", None).unwrap();
        assert!(registry.table("usertable").unwrap().rule.is_none());

        assert!(matches!(
            registry.route_write("usertable", "u1"),
            Err(KvError::Unavailable(_))
        ));

        registry.register_shard(leader("shard-1", "http://a:8000"));
        assert_eq!(registry.route_write("usertable", "u1").unwrap(), "http://a:8000");

        registry.register_shard(leader("shard-2", "http://b:8000"));
        for key in ["u1", "u2", "u3", "u4"] {
            assert_eq!(registry.route_write("usertable", key).unwrap(), "http://a:8000");
        }
    }

    #[test]
    fn test_explicit_shard_list() {
        let registry = registry();
        registry.register_shard(leader("shard-1", "http://a:8000"));
        registry.register_shard(leader("shard-2", "http://b:8000"));
        registry
            .create_table("orders", Some(vec!["shard-2".to_string()]))
            .unwrap();

        assert_eq!(registry.route_write("orders", "anything").unwrap(), "http://b:8000");
    }

    // ============================================================
    // ROUTING
    // ============================================================

    #[test]
    fn test_unknown_table() {
        let registry = registry();
        assert!(matches!(
            registry.route_read("nope", "u1"),
            Err(KvError::TableNotFound(_))
        ));
    }

    #[test]
    fn test_routing_is_stable() {
        let rule = PartitionRule::Hash {
            shard_ids: vec!["s1".into(), "s2".into(), "s3".into()],
        };
        for key in ["alpha", "beta", "gamma", "user42"] {
            let first = rule.shard_for(key).unwrap();
            for _ in 0..10 {
                assert_eq!(rule.shard_for(key).unwrap(), first);
            }
        }

        let expected = (crc32fast::hash(b"user42") % 3) as usize;
        assert_eq!(rule.shard_for("user42").unwrap(), ["s1", "s2", "s3"][expected]);
        assert!(PartitionRule::Hash { shard_ids: vec![] }.shard_for("x").is_none());
    }

    #[test]
    fn test_compound_keys_share_a_shard() {
        assert_eq!(storage_key("u1", None), "u1");
        assert_eq!(storage_key("u1", Some("")), "u1");
        assert_eq!(storage_key("u1", Some("2024")), "u1#2024");

        let registry = registry();
        for i in 1..=4 {
            registry.register_shard(leader(&format!("shard-{}", i), &format!("http://s{}:8000", i)));
        }
        registry.create_table("events", None).unwrap();

        // Routing only ever sees the partition key.
        let shard = registry.resolve_shard("events", "u1").unwrap();
        assert_eq!(registry.resolve_shard("events", "u1").unwrap(), shard);
    }

    #[test]
    fn test_replicas_include_followers() {
        let registry = registry();
        registry.register_shard(leader("shard-1", "http://a:8000"));
        registry.register_shard(follower("shard-1", "http://b:8000", "http://a:8000"));
        registry.create_table("usertable", None).unwrap();

        let replicas = registry.route_replicas("usertable", "u1").unwrap();
        assert_eq!(replicas, vec!["http://a:8000", "http://b:8000"]);
    }

    #[test]
    fn test_stale_descriptor_becomes_unavailable() {
        let registry = ShardRegistry::new(Duration::from_millis(20));
        registry.register_shard(leader("shard-1", "http://a:8000"));
        registry.create_table("usertable", None).unwrap();
        assert!(registry.route_write("usertable", "u1").is_ok());

        std::thread::sleep(Duration::from_millis(40));
        // Routing checks freshness even before the sweeper runs.
        assert!(matches!(
            registry.route_write("usertable", "u1"),
            Err(KvError::Unavailable(_))
        ));

        assert_eq!(registry.sweep(), 1);
        assert_eq!(registry.sweep(), 0);
        assert_eq!(
            registry.groups()[0].leader.as_ref().unwrap().health,
            ShardHealth::Unavailable
        );

        // A fresh heartbeat restores it.
        registry.register_shard(leader("shard-1", "http://a:8000"));
        assert!(registry.route_write("usertable", "u1").is_ok());
        assert_eq!(registry.healthy_leaders(), 1);
    }
}
