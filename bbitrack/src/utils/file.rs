pub mod reopen;
pub mod tell;
