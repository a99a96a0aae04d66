pub mod fusion;
pub mod gemm;
pub mod graph;


pub mod prelude {
    pub use crate::fusion::*;
    pub use crate::gemm::*;
    pub use crate::graph::*;
}
