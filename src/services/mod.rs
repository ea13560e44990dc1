pub mod allocations;
pub mod batch;
pub mod budget_scope;
pub mod lifecycle;
pub mod payment_transfers;
pub mod recurring;
pub mod report_validation;
pub mod reports;
pub mod review;

#[cfg(test)]
pub(crate) mod test_support;
