// Domain modules. Substrate is only ever mutated through governance; the
// pipeline turns captured dumps into proposed substrate and artifacts.

pub mod baskets;
pub mod documents;
pub mod dumps;
pub mod governance;
pub mod pipeline;
pub mod reflections;
pub mod substrate;
