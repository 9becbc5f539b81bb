#![no_main]
use alloc_hater::AllocatorOp;
use arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use tagalloc::{HeapConfig, ALIGNMENT, MIN_BLOCK_SIZE};
use tagalloc_hater::HeapSubject;

const MAX_CAPACITY: usize = 8 << 20;
const MAX_CHUNK_BLOCKS: usize = 512;

#[derive(Clone, Debug)]
struct Args {
    capacity: usize,
    chunk_size: usize,
    ops: Vec<AllocatorOp>,
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        let capacity = usize::arbitrary(un)? % MAX_CAPACITY;
        let chunk_size = MIN_BLOCK_SIZE + ALIGNMENT * (usize::arbitrary(un)? % MAX_CHUNK_BLOCKS);
        let ops = Vec::arbitrary(un)?;

        Ok(Args {
            capacity,
            chunk_size,
            ops,
        })
    }
}

fuzz_target!(|args: Args| {
    let Args {
        capacity,
        chunk_size,
        ops,
    } = args;

    let config = HeapConfig::new().with_chunk_size(chunk_size);
    let subject = match HeapSubject::with_config(capacity, config) {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut eval = alloc_hater::Evaluator::new(subject);
    eval.evaluate(ops).unwrap();

    let report = eval.subject().heap().check(false);
    assert!(report.is_consistent(), "{report:?}");
});
