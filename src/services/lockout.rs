use std::str::FromStr;

use time::{Duration, OffsetDateTime};

/// ロック閾値（失敗回数とロック時間の組）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutThreshold {
    pub attempts: i32,
    pub lockout_minutes: i64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LockoutPolicyError {
    #[error("閾値の形式が不正です: {0}")]
    InvalidEntry(String),

    #[error("閾値は1以上である必要があります: {0}")]
    NonPositive(String),
}

/// 連続ログイン失敗に対するアカウントロック方針
///
/// 閾値は試行回数の降順で保持し、失敗回数以下の最初の閾値を採用する。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockoutPolicy {
    thresholds: Vec<LockoutThreshold>,
}

impl LockoutPolicy {
    pub fn new(mut thresholds: Vec<LockoutThreshold>) -> Self {
        thresholds.sort_by(|a, b| b.attempts.cmp(&a.attempts));
        Self { thresholds }
    }

    /// 降順にソート済みの閾値一覧
    pub fn thresholds(&self) -> &[LockoutThreshold] {
        &self.thresholds
    }

    /// 失敗回数に対応する閾値を検索
    pub fn threshold_for(&self, failed_count: i32) -> Option<&LockoutThreshold> {
        self.thresholds
            .iter()
            .find(|threshold| threshold.attempts <= failed_count)
    }

    /// 失敗回数からロック解除時刻を算出（ロック不要なら None）
    pub fn locked_until(&self, failed_count: i32, now: OffsetDateTime) -> Option<OffsetDateTime> {
        self.threshold_for(failed_count)
            .map(|threshold| now + Duration::minutes(threshold.lockout_minutes))
    }
}

impl FromStr for LockoutPolicy {
    type Err = LockoutPolicyError;

    /// "5:15,10:60" 形式をパース
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let thresholds = s
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let (attempts, minutes) = entry
                    .split_once(':')
                    .ok_or_else(|| LockoutPolicyError::InvalidEntry(entry.to_string()))?;
                let attempts: i32 = attempts
                    .trim()
                    .parse()
                    .map_err(|_| LockoutPolicyError::InvalidEntry(entry.to_string()))?;
                let lockout_minutes: i64 = minutes
                    .trim()
                    .parse()
                    .map_err(|_| LockoutPolicyError::InvalidEntry(entry.to_string()))?;
                if attempts <= 0 || lockout_minutes <= 0 {
                    return Err(LockoutPolicyError::NonPositive(entry.to_string()));
                }
                Ok(LockoutThreshold {
                    attempts,
                    lockout_minutes,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::new(thresholds))
    }
}

/// 失敗回数減衰の対象となる最終更新時刻の上限
pub fn decay_cutoff(now: OffsetDateTime, decay_minutes: i64) -> OffsetDateTime {
    now - Duration::minutes(decay_minutes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> LockoutPolicy {
        "5:15,20:1440,10:60".parse().unwrap()
    }

    #[test]
    fn test_thresholds_sorted_descending() {
        let attempts: Vec<i32> = policy().thresholds().iter().map(|t| t.attempts).collect();
        assert_eq!(attempts, vec![20, 10, 5]);
    }

    #[test]
    fn test_below_first_threshold_not_locked() {
        let now = OffsetDateTime::now_utc();
        assert!(policy().locked_until(4, now).is_none());
        assert!(policy().locked_until(0, now).is_none());
    }

    #[test]
    fn test_matching_threshold_selected() {
        let now = OffsetDateTime::now_utc();
        let policy = policy();
        assert_eq!(policy.locked_until(5, now), Some(now + Duration::minutes(15)));
        assert_eq!(policy.locked_until(9, now), Some(now + Duration::minutes(15)));
        assert_eq!(policy.locked_until(10, now), Some(now + Duration::minutes(60)));
        assert_eq!(
            policy.locked_until(25, now),
            Some(now + Duration::minutes(1440))
        );
    }

    #[test]
    fn test_consecutive_failures_cross_threshold() {
        let now = OffsetDateTime::now_utc();
        let policy = policy();
        let first_lock = (1..=10).find(|count| policy.locked_until(*count, now).is_some());
        assert_eq!(first_lock, Some(5));
    }

    #[test]
    fn test_parse_invalid_entry() {
        assert_eq!(
            "5-15".parse::<LockoutPolicy>(),
            Err(LockoutPolicyError::InvalidEntry("5-15".to_string()))
        );
        assert!("abc:15".parse::<LockoutPolicy>().is_err());
    }

    #[test]
    fn test_parse_non_positive() {
        assert_eq!(
            "0:15".parse::<LockoutPolicy>(),
            Err(LockoutPolicyError::NonPositive("0:15".to_string()))
        );
    }

    #[test]
    fn test_empty_policy_never_locks() {
        let policy: LockoutPolicy = "".parse().unwrap();
        assert!(policy.locked_until(100, OffsetDateTime::now_utc()).is_none());
    }

    #[test]
    fn test_decay_cutoff() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(decay_cutoff(now, 60), now - Duration::hours(1));
    }
}
