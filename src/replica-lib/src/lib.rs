mod access_store;
mod annotations;
mod catalog;
mod config;
mod dealer;
mod demand;
mod detox;
mod error;
mod glob;
mod history;
mod inventory;
mod lock;
mod manager;
mod popularity;
mod quota;
mod rest;
mod retry;

pub use access_store::*;
pub use annotations::*;
pub use catalog::*;
pub use config::*;
pub use dealer::*;
pub use demand::*;
pub use detox::*;
pub use error::*;
pub use glob::*;
pub use history::*;
pub use inventory::*;
pub use lock::*;
pub use manager::*;
pub use popularity::*;
pub use quota::*;
pub use rest::*;
pub use retry::*;

#[cfg(test)]
mod test_cycle;
