//! Extension point deciding whether a claimed work type may be closed

use crate::models::{WorkType, Worksite};

/// Result of a claim-close threshold check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimThresholdStatus {
    Within,
    Exceeded,
    /// No threshold policy is configured
    NotSpecified,
}

/// Policy limiting how many claimed work types an organization may hold
/// open before it must close some
pub trait ClaimCloseThreshold: Send + Sync {
    fn is_within_claim_close_threshold(
        &self,
        worksite: &Worksite,
        work_type: &WorkType,
        organization_id: i64,
    ) -> ClaimThresholdStatus;
}

/// Default policy: no threshold
#[derive(Debug, Clone, Copy, Default)]
pub struct NotSpecifiedClaimThreshold;

impl ClaimCloseThreshold for NotSpecifiedClaimThreshold {
    fn is_within_claim_close_threshold(
        &self,
        _worksite: &Worksite,
        _work_type: &WorkType,
        _organization_id: i64,
    ) -> ClaimThresholdStatus {
        ClaimThresholdStatus::NotSpecified
    }
}

/// Work types of `worksite` claimed by `organization_id` that are still open
#[must_use]
pub fn open_claims(worksite: &Worksite, organization_id: i64) -> Vec<&WorkType> {
    worksite
        .work_types
        .iter()
        .filter(|work_type| work_type.org_claim == Some(organization_id))
        .filter(|work_type| work_type.status.starts_with("open"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MaxOpenClaims(usize);

    impl ClaimCloseThreshold for MaxOpenClaims {
        fn is_within_claim_close_threshold(
            &self,
            worksite: &Worksite,
            _work_type: &WorkType,
            organization_id: i64,
        ) -> ClaimThresholdStatus {
            if open_claims(worksite, organization_id).len() <= self.0 {
                ClaimThresholdStatus::Within
            } else {
                ClaimThresholdStatus::Exceeded
            }
        }
    }

    fn claimed(name: &str, status: &str, org: i64) -> WorkType {
        let mut work_type = WorkType::new(name, status);
        work_type.org_claim = Some(org);
        work_type
    }

    #[test]
    fn test_default_policy_is_not_specified() {
        let worksite = Worksite::new(1, 0.0, 0.0);
        let work_type = WorkType::new("trees", "open_unassigned");
        let policy: Box<dyn ClaimCloseThreshold> = Box::new(NotSpecifiedClaimThreshold);
        assert_eq!(
            policy.is_within_claim_close_threshold(&worksite, &work_type, 7),
            ClaimThresholdStatus::NotSpecified
        );
    }

    #[test]
    fn test_custom_policy_counts_open_claims() {
        let mut worksite = Worksite::new(1, 0.0, 0.0);
        worksite.work_types = vec![
            claimed("trees", "open_assigned", 7),
            claimed("debris", "open_partially-completed", 7),
            claimed("roof", "closed_completed", 7),
            claimed("mold", "open_assigned", 8),
        ];
        assert_eq!(open_claims(&worksite, 7).len(), 2);

        let policy = MaxOpenClaims(1);
        assert_eq!(
            policy.is_within_claim_close_threshold(&worksite, &worksite.work_types[0], 7),
            ClaimThresholdStatus::Exceeded
        );
        assert_eq!(
            policy.is_within_claim_close_threshold(&worksite, &worksite.work_types[3], 8),
            ClaimThresholdStatus::Within
        );
    }
}
