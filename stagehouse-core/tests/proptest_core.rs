//! Property-based tests for core components using proptest.

use proptest::prelude::*;
use std::sync::Arc;

use stagehouse_core::pipeline::GraphBuilder;
use stagehouse_core::retry::RetryPolicy;
use stagehouse_core::warehouse::CopyOptions;
use stagehouse_core::warehouse::delimited::parse_records;
use stagehouse_core::{EmptyStage, Runnable};

// --- Graph ordering properties ---

proptest! {
    /// Edges only ever point from a lower to a higher index, so any such
    /// edge set is acyclic and the built order must respect every edge.
    #[test]
    fn topological_order_respects_edges(
        n in 2usize..12,
        raw_edges in prop::collection::vec((0usize..12, 0usize..12), 0..30),
    ) {
        let mut builder = GraphBuilder::new("prop");
        for i in 0..n {
            let stage: Arc<dyn Runnable> = Arc::new(EmptyStage);
            builder = builder.stage(format!("s{i}"), stage);
        }
        let edges: Vec<(usize, usize)> = raw_edges
            .into_iter()
            .map(|(a, b)| (a % n, b % n))
            .filter(|(a, b)| a < b)
            .collect();
        for (a, b) in &edges {
            builder = builder.depends_on(format!("s{b}"), format!("s{a}"));
        }
        let graph = builder.build().unwrap();
        prop_assert_eq!(graph.len(), n);
        for (a, b) in &edges {
            let pa = graph.position(&format!("s{a}")).unwrap();
            let pb = graph.position(&format!("s{b}")).unwrap();
            prop_assert!(pa < pb);
        }
    }

    #[test]
    fn back_edge_is_always_a_cycle(n in 2usize..10) {
        let mut builder = GraphBuilder::new("prop");
        let mut names = Vec::new();
        for i in 0..n {
            let stage: Arc<dyn Runnable> = Arc::new(EmptyStage);
            builder = builder.stage(format!("s{i}"), stage);
            names.push(format!("s{i}"));
        }
        let layers: Vec<&str> = names.iter().map(String::as_str).collect();
        builder = builder.chain(&layers).depends_on("s0", format!("s{}", n - 1));
        prop_assert!(builder.build().is_err());
    }
}

// --- Delimited field properties ---

proptest! {
    #[test]
    fn unquoted_split_rejoins_to_input(
        fields in prop::collection::vec("[a-zA-Z0-9 .:-]{1,12}", 1..8),
    ) {
        let line = format!("{}\n", fields.join("\t"));
        let records = parse_records(&line, &CopyOptions::default(), &[]).unwrap();
        prop_assert_eq!(records.len(), 1);
        let split: Vec<String> = records[0].fields.iter().flatten().cloned().collect();
        prop_assert_eq!(split, fields);
    }

    #[test]
    fn quoted_fields_survive_delimiters_and_quotes(
        fields in prop::collection::vec("[a-z,\" ]{0,10}", 1..6),
    ) {
        let line = fields
            .iter()
            .map(|f| format!("\"{}\"", f.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(",");
        let options = CopyOptions {
            delimiter: ',',
            quote: Some('"'),
            ..Default::default()
        };
        let records = parse_records(&line, &options, &[]).unwrap();
        prop_assert_eq!(records.len(), 1);
        let split: Vec<String> = records[0].fields.iter().flatten().cloned().collect();
        prop_assert_eq!(split, fields);
    }
}

// --- Retry delay properties ---

proptest! {
    #[test]
    fn exponential_delay_is_monotonic_and_capped(
        base in 1u64..600,
        cap in 1u64..7200,
        attempt in 2u32..40,
    ) {
        let policy = RetryPolicy {
            retries: 50,
            retry_delay_secs: base,
            backoff: stagehouse_core::Backoff::Exponential,
            max_retry_delay_secs: Some(cap),
        };
        let this = policy.delay_before(attempt);
        let next = policy.delay_before(attempt + 1);
        prop_assert!(this <= next);
        prop_assert!(next.as_secs() <= cap);
    }
}
