// Path: crates/alloc/tests/monotonic.rs
//! ID monotonicity: no allocator instance, across any number of
//! restarts, ever hands out an ID at or below one handed out before.

use std::sync::Arc;

use meridian_alloc::IdAllocator;
use meridian_store::{CoordKv, MemStore};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Alloc(u8),
    Restart,
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn ids_never_repeat_across_restarts(
        step in 1u64..50,
        ops in proptest::collection::vec(
            prop_oneof![(1u8..30).prop_map(Op::Alloc), Just(Op::Restart)],
            1..60,
        ),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let store = Arc::new(MemStore::new());
            let mut alloc =
                IdAllocator::with_step(Arc::clone(&store) as Arc<dyn CoordKv>, step);
            let mut last: Option<u64> = None;
            for op in ops {
                match op {
                    Op::Alloc(n) => {
                        let (first, count) = alloc.alloc(n as u64).await.unwrap();
                        prop_assert!(count >= 1);
                        if let Some(last) = last {
                            prop_assert!(first > last, "id {first} reissued at or below {last}");
                        }
                        last = Some(first + count - 1);
                    }
                    Op::Restart => {
                        alloc = IdAllocator::with_step(
                            Arc::clone(&store) as Arc<dyn CoordKv>,
                            step,
                        );
                    }
                }
            }
            Ok(())
        })?;
    }
}
