//! Property tests over whole runs

mod common;

use common::{generator, prepare, Collected};
use proptest::prelude::*;
use rowflow::pipeline::{Graph, NodeDef, RunState};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Every row produced reaches the sink exactly once, whatever the queue
    /// capacity and the copy counts on either side.
    #[test]
    fn test_rows_conserved(
        rows in 0i64..400,
        capacity in 1usize..32,
        producers in 1usize..4,
        middle in 1usize..4,
    ) {
        let sink = Collected::new();
        let graph = Graph::new("conserve")
            .node(generator("gen", rows, &["id:integer"]).copies(producers))
            .node(NodeDef::new("mid", "pass-through").copies(middle))
            .node(NodeDef::new("out", "collect"))
            .edge("gen", "mid")
            .edge("mid", "out");

        let run = prepare(&graph, &sink, capacity);
        run.start().unwrap();
        run.wait_until_finished();

        let status = run.status();
        prop_assert_eq!(status.state, RunState::Finished);
        prop_assert_eq!(sink.len() as i64, rows * producers as i64);
        prop_assert_eq!(status.rows_written("gen"), status.rows_read("out"));
    }
}
