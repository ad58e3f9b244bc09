//! 记忆层性质测试：相关度截断、各分区容量上限

use proptest::prelude::*;
use serde_json::json;

use jobhound::config::MemorySection;
use jobhound::memory::{relevance_score, MemoryKind, MemoryManager, Role, WorkingKey};

const WORKING_KEYS: [WorkingKey; 8] = [
    WorkingKey::Task,
    WorkingKey::Goal,
    WorkingKey::LastObservation,
    WorkingKey::LastAction,
    WorkingKey::LastResult,
    WorkingKey::Cursor,
    WorkingKey::Candidates,
    WorkingKey::Collected,
];

fn any_f64() -> impl Strategy<Value = f64> {
    prop_oneof![
        -10.0..10.0f64,
        Just(f64::NAN),
        Just(f64::INFINITY),
        Just(f64::NEG_INFINITY),
        any::<f64>(),
    ]
}

#[derive(Debug, Clone)]
enum Op {
    Observe(f64),
    Work(usize, f64),
    Say(String),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0.0..1.0f64).prop_map(Op::Observe),
        (0..WORKING_KEYS.len(), 0.0..1.0f64).prop_map(|(k, i)| Op::Work(k, i)),
        "[a-z]{1,8}".prop_map(Op::Say),
    ]
}

proptest! {
    #[test]
    fn relevance_is_always_in_unit_interval(
        importance in any_f64(),
        hours in any_f64(),
        access_count in any::<u32>(),
        overlap in proptest::option::of((0usize..20, 0usize..20)),
    ) {
        let score = relevance_score(importance, hours, access_count, overlap);
        prop_assert!((0.0..=1.0).contains(&score), "score {score}");
    }

    #[test]
    fn partitions_never_exceed_capacity(
        short_term in 1usize..8,
        working in 1usize..4,
        conversation in 1usize..6,
        ops in proptest::collection::vec(op(), 0..60),
    ) {
        let limits = MemorySection {
            short_term_capacity: short_term,
            working_capacity: working,
            conversation_capacity: conversation,
        };
        let mut memory = MemoryManager::new(&limits);
        for (step, op) in ops.into_iter().enumerate() {
            match op {
                Op::Observe(importance) => {
                    memory.add_observation(json!({ "step": step }), MemoryKind::Observation, importance, ["sample"], 1.0);
                }
                Op::Work(k, importance) => {
                    let key = WORKING_KEYS[k];
                    memory.set_working(key, json!(step), importance, ["sample"]);
                    // 刚写入的键不会被淘汰
                    prop_assert_eq!(memory.peek_working(key), Some(&json!(step)));
                }
                Op::Say(text) => memory.add_conversation(Role::User, text),
            }
            let stats = memory.stats();
            prop_assert!(stats.short_term <= short_term);
            prop_assert!(stats.working <= working);
            prop_assert!(stats.conversation <= conversation);
        }
    }
}
