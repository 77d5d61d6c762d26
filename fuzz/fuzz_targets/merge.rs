#![no_main]

use libfuzzer_sys::fuzz_target;
use rankflame::flamegraph::{self, Options};
use rankflame::merge::{self, Provenance, Source};

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    let sources = vec![Source::text(Provenance::rank(0), text.as_ref())];
    let (aggregate, _) = merge::merge(sources, &merge::Options::default());
    if !aggregate.is_empty() {
        flamegraph::from_aggregate(&Options::default(), &aggregate, std::io::sink()).unwrap();
    }
});
