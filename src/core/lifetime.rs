use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Expiration instant of a session. An unset instant means the session
/// never expires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifeTime {
    expires_at: Option<DateTime<Utc>>,
}

impl LifeTime {
    /// A lifetime that never ends.
    pub fn never() -> Self {
        Self::default()
    }

    pub fn at(expires_at: DateTime<Utc>) -> Self {
        Self {
            expires_at: Some(expires_at),
        }
    }

    /// `now + expires` for a positive duration, otherwise a lifetime that
    /// never ends.
    pub fn begin(now: DateTime<Utc>, expires: Duration) -> Self {
        if expires <= Duration::zero() {
            return Self::never();
        }

        Self {
            expires_at: now.checked_add_signed(expires),
        }
    }

    /// Replaces the expiration instant with one stamped from `now`.
    pub fn shift(&mut self, now: DateTime<Utc>, expires: Duration) {
        *self = Self::begin(now, expires);
    }

    pub fn is_zero(&self) -> bool {
        self.expires_at.is_none()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn has_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(t) if t <= now)
    }

    /// Time left before expiration; `None` for a lifetime that never ends.
    pub fn duration_until_expiration(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at
            .map(|t| if t > now { t - now } else { Duration::zero() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_positive_duration_never_expires() {
        let now = Utc::now();
        assert!(LifeTime::begin(now, Duration::zero()).is_zero());
        assert!(LifeTime::begin(now, Duration::seconds(-1)).is_zero());
        assert!(!LifeTime::never().has_expired(now + Duration::days(10_000)));
    }

    #[test]
    fn test_expiration_boundary() {
        let now = Utc::now();
        let lifetime = LifeTime::begin(now, Duration::minutes(5));

        assert!(!lifetime.has_expired(now));
        assert!(!lifetime.has_expired(now + Duration::minutes(4)));
        assert!(lifetime.has_expired(now + Duration::minutes(5)));
        assert_eq!(
            lifetime.duration_until_expiration(now + Duration::minutes(1)),
            Some(Duration::minutes(4))
        );
        assert_eq!(
            lifetime.duration_until_expiration(now + Duration::minutes(9)),
            Some(Duration::zero())
        );
    }

    #[test]
    fn test_shift_restamps_from_now() {
        let now = Utc::now();
        let mut lifetime = LifeTime::begin(now, Duration::minutes(5));
        lifetime.shift(now + Duration::minutes(3), Duration::minutes(5));

        assert_eq!(lifetime.expires_at(), Some(now + Duration::minutes(8)));
    }
}
