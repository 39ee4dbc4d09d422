pub mod database;
pub mod transactions;

pub use database::KronDB;
pub use transactions::WriteTxn;
