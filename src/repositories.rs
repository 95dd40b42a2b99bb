pub mod blockchain;
pub mod pix;
pub mod taxes;
pub mod transactions;
pub mod users;
