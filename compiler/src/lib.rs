// doff — device offload for dataflow program graphs
//
// Library root. Transform stages are added as modules here.

pub mod control;
pub mod descend;
pub mod discover;
pub mod dot;
pub mod elide;
pub mod expr;
pub mod ir;
pub mod loops;
pub mod scalars;
pub mod shadow;
pub mod simplify;
pub mod transform;
pub mod transients;
