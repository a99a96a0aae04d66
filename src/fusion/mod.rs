// Graph-rewrite passes and the machinery shared between them

use std::fmt::Debug;

use colored::Colorize;

use crate::graph::Graph;

mod attention;
pub use attention::AttentionFusion;

/// A single graph-rewrite pass. Passes scan the graph for their pattern,
/// plan mutations while matching, and commit them in one go.
pub trait FusionPass {
    /// Run the pass over the graph
    fn apply(&mut self, graph: &mut Graph);
}

impl FusionPass for () {
    fn apply(&mut self, _: &mut Graph) {}
}

/// Wrap this around a pass to measure the time it takes to run
#[derive(Debug)]
pub struct Timed<P: FusionPass + Debug>(pub P);

impl<P: FusionPass + Debug> FusionPass for Timed<P> {
    fn apply(&mut self, graph: &mut Graph) {
        let pass_name = format!("{:?}", self.0).bold();
        println!("Starting {pass_name}");
        let start = std::time::Instant::now();
        self.0.apply(graph);
        let finished_millis = start.elapsed().as_millis();
        let seconds = finished_millis / 1000;
        let millis = finished_millis % 1000;
        println!(
            "Finished {pass_name} in {}",
            if seconds > 0 {
                format!("{seconds}s {millis}ms")
            } else {
                format!("{millis}ms")
            }
            .bold()
        );
    }
}

macro_rules! tuple_impls {
    ([$($name:ident),+] , [$($idx:tt),+]) => {
        impl<
        $($name:
            FusionPass, )+
        > FusionPass for ($($name,)+) {
            fn apply(&mut self, graph: &mut Graph) {
                $(self.$idx.apply(graph);)+
            }
        }
    };
}

tuple_impls!([P1], [0]);
tuple_impls!([P1, P2], [0, 1]);
tuple_impls!([P1, P2, P3], [0, 1, 2]);
tuple_impls!([P1, P2, P3, P4], [0, 1, 2, 3]);

/// Whether or not to do debug prints (env var DEBUG=1)
pub fn debug() -> bool {
    std::env::var("DEBUG")
        .unwrap_or_default()
        .parse::<i32>()
        .map(|i| i == 1)
        .unwrap_or_default()
}
