// Domain-layer modules and shared errors/models
pub mod orchestrator {
    pub use crate::orchestrator::*;
}

pub mod ledger {
    pub use crate::ledger::*;
}

pub mod dedup {
    pub use crate::dedup::*;
}

pub mod normalizer {
    pub use crate::normalizer::*;
}

pub mod guard {
    pub use crate::guard::*;
}

pub mod models {
    pub use crate::models::*;
}

pub mod errors {
    pub use crate::errors::*;
}
