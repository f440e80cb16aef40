pub mod ctl;
pub mod serve;
