pub mod pix;
pub mod queue;
pub mod taxes;
pub mod transactions;
