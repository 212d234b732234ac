//! External provider integrations.

pub mod gateway {
    pub use crate::gateway::*;
}

pub mod web_search {
    pub use crate::web_search::*;
}

pub mod places {
    pub use crate::places::*;
}

pub mod query_parser {
    pub use crate::query_parser::*;
}

pub mod providers {
    pub use crate::providers::*;
}
