use serde::Serialize;

use crate::error::{AppError, AppResult};

pub const MAX_BATCH_SIZE: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchItemError {
    pub id: i64,
    pub error: String,
}

/// Per-item outcome of a batch status change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub updated: u32,
    pub errors: Vec<BatchItemError>,
}

impl BatchReport {
    /// Records one item. Business-rule failures are kept and the loop goes
    /// on; infrastructure failures are returned so the caller aborts and the
    /// transaction rolls back.
    pub fn record(&mut self, id: i64, outcome: AppResult<()>) -> AppResult<()> {
        match outcome {
            Ok(()) => {
                self.updated += 1;
                Ok(())
            }
            Err(error) if error.is_infrastructure() => Err(error),
            Err(error) => {
                self.errors.push(BatchItemError {
                    id,
                    error: error.public_message(),
                });
                Ok(())
            }
        }
    }
}

/// Deduplicates ids preserving first-seen order and enforces batch bounds.
pub fn normalize_batch_ids(ids: &[i64]) -> AppResult<Vec<i64>> {
    let mut unique = Vec::with_capacity(ids.len());
    for id in ids {
        if !unique.contains(id) {
            unique.push(*id);
        }
    }

    if unique.is_empty() {
        return Err(AppError::BadRequest("ids must not be empty.".to_string()));
    }
    if unique.len() > MAX_BATCH_SIZE {
        return Err(AppError::BadRequest(format!(
            "At most {MAX_BATCH_SIZE} ids can be processed per batch."
        )));
    }
    if unique.iter().any(|id| *id <= 0) {
        return Err(AppError::BadRequest("ids must be positive.".to_string()));
    }
    Ok(unique)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn business_failures_are_reported_and_loop_continues() {
        let mut report = BatchReport::default();
        let outcomes = vec![
            (1, Ok(())),
            (
                2,
                Err(AppError::Conflict("Reimbursement is already paid.".to_string())),
            ),
            (3, Ok(())),
        ];

        for (id, outcome) in outcomes {
            report.record(id, outcome).expect("business errors do not abort");
        }

        assert_eq!(report.updated, 2);
        assert_eq!(
            report.errors,
            vec![BatchItemError {
                id: 2,
                error: "Reimbursement is already paid.".to_string(),
            }]
        );
    }

    #[test]
    fn infrastructure_failure_aborts_the_batch() {
        let mut report = BatchReport::default();
        report.record(1, Ok(())).expect("ok");
        let aborted = report.record(2, Err(AppError::Dependency("connection reset".to_string())));
        assert!(matches!(aborted, Err(AppError::Dependency(_))));
        assert!(report.errors.is_empty());
    }

    #[test]
    fn ids_are_deduplicated_in_order() {
        assert_eq!(normalize_batch_ids(&[3, 1, 3, 2, 1]).ok(), Some(vec![3, 1, 2]));
        assert!(normalize_batch_ids(&[]).is_err());
        assert!(normalize_batch_ids(&[0]).is_err());
        let too_many = (1..=(MAX_BATCH_SIZE as i64 + 1)).collect::<Vec<_>>();
        assert!(normalize_batch_ids(&too_many).is_err());
    }
}
