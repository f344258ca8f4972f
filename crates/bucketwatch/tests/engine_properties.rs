mod common;

use std::collections::BTreeSet;

use bucketwatch::types::{covers, ListenerId};
use bucketwatch::EngineError;
use common::{queue, Harness, BUCKET};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

const PREFIXES: [Option<&str>; 6] = [None, Some("a/"), Some("a/b/"), Some("a/b/c/"), Some("a/d/"), Some("e/")];

#[derive(Clone, Debug)]
enum Op {
    Add { prefix: usize, endpoint: usize },
    Remove { pick: usize },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..PREFIXES.len(), 0usize..3).prop_map(|(prefix, endpoint)| Op::Add { prefix, endpoint }),
        2 => (0usize..32).prop_map(|pick| Op::Remove { pick }),
    ]
}

fn check_invariants(h: &Harness, added: &[(ListenerId, String)]) -> Result<(), TestCaseError> {
    let active = h.engine.active_notifications(BUCKET).unwrap();
    for (i, a) in active.iter().enumerate() {
        for (j, b) in active.iter().enumerate() {
            if i != j {
                prop_assert!(
                    !covers(a.prefix.as_deref(), b.prefix.as_deref()),
                    "{:?} overlaps {:?}",
                    a.prefix,
                    b.prefix
                );
            }
        }
    }
    prop_assert_eq!(h.bucket_config_ids(BUCKET), h.active_config_ids(BUCKET));

    for nfn in &active {
        let expected: BTreeSet<String> = added
            .iter()
            .filter_map(|(id, endpoint)| {
                let lst = h.engine.get_listener(id).unwrap()?;
                (lst.is_active() && lst.notification_id == nfn.id).then(|| endpoint.clone())
            })
            .collect();
        let mut subscribed = h.broker.subscribed_endpoints(&nfn.topic_arn);
        subscribed.sort();
        prop_assert_eq!(subscribed, expected.into_iter().collect::<Vec<_>>());
    }

    for (id, _) in added {
        let lst = h.engine.get_listener(id).unwrap().unwrap();
        if !lst.is_active() {
            continue;
        }
        let nfn = h.engine.get_notification(&lst.notification_id).unwrap();
        prop_assert!(nfn.is_some(), "listener {} is orphaned", id);
        let nfn = nfn.unwrap();
        prop_assert!(nfn.is_active());
        prop_assert!(covers(nfn.prefix.as_deref(), lst.prefix.as_deref()));
    }
    Ok(())
}

fn run_ops(ops: Vec<Op>) -> Result<(), TestCaseError> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let h = Harness::new();
    let mut added: Vec<(ListenerId, String)> = Vec::new();

    for op in ops {
        match op {
            Op::Add { prefix, endpoint } => {
                let endpoint = queue(&format!("q{}", endpoint));
                let id = rt
                    .block_on(h.engine.add_listener(BUCKET, PREFIXES[prefix], "sqs", &endpoint, None))
                    .unwrap();
                added.push((id, endpoint));
            }
            Op::Remove { pick } => {
                if added.is_empty() {
                    continue;
                }
                let (id, _) = &added[pick % added.len()];
                match rt.block_on(h.engine.remove_listener(id)) {
                    Ok(_) | Err(EngineError::ListenerInactive(_)) => {}
                    Err(e) => return Err(TestCaseError::fail(format!("remove failed: {}", e))),
                }
            }
        }
        check_invariants(&h, &added)?;
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_coverage_invariants_hold(ops in proptest::collection::vec(arb_op(), 1..24)) {
        run_ops(ops)?;
    }
}
