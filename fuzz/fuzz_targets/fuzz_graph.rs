#![no_main]

use bufuse_fusion::{FusionConfig, FusionEngine};
use bufuse_graph::ComputeGraph;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        // Parsing and fusing an arbitrary graph should never panic.
        if let Ok(mut graph) = ComputeGraph::from_json(text) {
            let _ = FusionEngine::with_builtins(FusionConfig::default()).run(&mut graph);
        }
    }
});
