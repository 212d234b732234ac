//! Storage seams and their Postgres and in-memory implementations.

pub mod db {
    pub use crate::db::*;
}

pub mod db_storage {
    pub use crate::db_storage::*;
}

pub mod memory_storage {
    pub use crate::memory_storage::*;
}

pub mod store {
    pub use crate::store::*;
}
