//! Status lifecycle shared by reimbursements and charges.

use serde::Serialize;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    UnderReview,
    Approved,
    Rejected,
    Paid,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::UnderReview => "under_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Paid => "paid",
        }
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim() {
            "pending" => Ok(Self::Pending),
            "under_review" => Ok(Self::UnderReview),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "paid" => Ok(Self::Paid),
            other => Err(AppError::BadRequest(format!("Unknown status '{other}'."))),
        }
    }

    /// Items that are part of, or settled by, a payment transfer.
    pub fn is_settling(self) -> bool {
        matches!(self, Self::Approved | Self::Paid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Reimbursement,
    Charge,
}

impl ItemKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Reimbursement => "Reimbursement",
            Self::Charge => "Charge",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            Self::Reimbursement => "reimbursements",
            Self::Charge => "charges",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusAction {
    Approve,
    Reject,
    MarkForReview,
    ReturnToPending,
}

impl StatusAction {
    pub fn target(self) -> ItemStatus {
        match self {
            Self::Approve => ItemStatus::Approved,
            Self::Reject => ItemStatus::Rejected,
            Self::MarkForReview => ItemStatus::UnderReview,
            Self::ReturnToPending => ItemStatus::Pending,
        }
    }

    pub fn verb(self) -> &'static str {
        match self {
            Self::Approve => "approved",
            Self::Reject => "rejected",
            Self::MarkForReview => "marked for review",
            Self::ReturnToPending => "returned to pending",
        }
    }
}

/// Checks a status action and returns the status the item moves to.
/// `paid` is only reachable through payment-transfer execution.
pub fn check_transition(
    kind: ItemKind,
    current: ItemStatus,
    action: StatusAction,
) -> AppResult<ItemStatus> {
    if current == ItemStatus::Paid {
        return Err(AppError::Conflict(format!(
            "{} is already paid.",
            kind.label()
        )));
    }

    let allowed = match action {
        StatusAction::Approve | StatusAction::Reject => {
            matches!(current, ItemStatus::Pending | ItemStatus::UnderReview)
        }
        StatusAction::MarkForReview => {
            kind == ItemKind::Reimbursement && current == ItemStatus::Pending
        }
        StatusAction::ReturnToPending => matches!(
            current,
            ItemStatus::UnderReview | ItemStatus::Rejected | ItemStatus::Approved
        ),
    };

    if allowed {
        return Ok(action.target());
    }

    if current == action.target() {
        return Err(AppError::Conflict(format!(
            "{} is already {}.",
            kind.label(),
            current.as_str()
        )));
    }

    Err(AppError::BadRequest(format!(
        "{} with status '{}' cannot be {}.",
        kind.label(),
        current.as_str(),
        action.verb()
    )))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditKind {
    Update,
    Delete,
}

/// Field edits and deletes by a treasurer of the item's scope. Reimbursements
/// stay editable until approved; charges only while pending, and rejected
/// charges may still be deleted.
pub fn check_treasurer_edit(kind: ItemKind, status: ItemStatus, edit: EditKind) -> AppResult<()> {
    let allowed = match kind {
        ItemKind::Reimbursement => !status.is_settling(),
        ItemKind::Charge => match edit {
            EditKind::Update => status == ItemStatus::Pending,
            EditKind::Delete => matches!(status, ItemStatus::Pending | ItemStatus::Rejected),
        },
    };
    if allowed {
        return Ok(());
    }
    Err(AppError::Conflict(format!(
        "{} is {} and cannot be modified.",
        kind.label(),
        status.as_str()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_from_open_states() {
        for from in [ItemStatus::Pending, ItemStatus::UnderReview] {
            assert_eq!(
                check_transition(ItemKind::Reimbursement, from, StatusAction::Approve).ok(),
                Some(ItemStatus::Approved)
            );
        }
    }

    #[test]
    fn paid_items_are_immutable() {
        for action in [
            StatusAction::Approve,
            StatusAction::Reject,
            StatusAction::MarkForReview,
            StatusAction::ReturnToPending,
        ] {
            let result = check_transition(ItemKind::Charge, ItemStatus::Paid, action);
            assert!(matches!(result, Err(AppError::Conflict(ref m)) if m.contains("already paid")));
        }
    }

    #[test]
    fn repeated_approval_is_a_conflict() {
        let result = check_transition(
            ItemKind::Reimbursement,
            ItemStatus::Approved,
            StatusAction::Approve,
        );
        assert!(matches!(result, Err(AppError::Conflict(_))));
    }

    #[test]
    fn rejected_items_must_return_to_pending_first() {
        let result = check_transition(
            ItemKind::Reimbursement,
            ItemStatus::Rejected,
            StatusAction::Approve,
        );
        assert!(matches!(result, Err(AppError::BadRequest(_))));
        assert_eq!(
            check_transition(
                ItemKind::Reimbursement,
                ItemStatus::Rejected,
                StatusAction::ReturnToPending
            )
            .ok(),
            Some(ItemStatus::Pending)
        );
    }

    #[test]
    fn charges_have_no_review_step() {
        assert!(check_transition(
            ItemKind::Charge,
            ItemStatus::Pending,
            StatusAction::MarkForReview
        )
        .is_err());
    }

    #[test]
    fn pending_cannot_return_to_pending() {
        let result = check_transition(
            ItemKind::Charge,
            ItemStatus::Pending,
            StatusAction::ReturnToPending,
        );
        assert!(matches!(result, Err(AppError::Conflict(_))));
    }

    #[test]
    fn approved_items_are_locked_for_treasurer_edits() {
        for kind in [ItemKind::Reimbursement, ItemKind::Charge] {
            for status in [ItemStatus::Approved, ItemStatus::Paid] {
                for edit in [EditKind::Update, EditKind::Delete] {
                    assert!(matches!(
                        check_treasurer_edit(kind, status, edit),
                        Err(AppError::Conflict(_))
                    ));
                }
            }
        }
    }

    #[test]
    fn rejected_charges_can_be_deleted_but_not_updated() {
        assert!(check_treasurer_edit(ItemKind::Charge, ItemStatus::Rejected, EditKind::Delete).is_ok());
        assert!(check_treasurer_edit(ItemKind::Charge, ItemStatus::Rejected, EditKind::Update).is_err());
        assert!(check_treasurer_edit(
            ItemKind::Reimbursement,
            ItemStatus::UnderReview,
            EditKind::Update
        )
        .is_ok());
    }
}
