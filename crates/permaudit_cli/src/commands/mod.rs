pub(crate) mod audit;
pub(crate) mod check;
pub(crate) mod limits;
pub(crate) mod meta;
pub(crate) mod report;
pub(crate) mod shared;
