use std::time::Duration;

use crate::options::Defaults;
use crate::redirect::RedirectPolicy;
use crate::retry::RetryPolicy;
use crate::timings::Delays;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClientProfile {
    /// No timeouts, two retries, up to ten redirects.
    #[default]
    Standard,
    LowLatency,
    Bulk,
}

#[derive(Clone, Debug)]
pub struct ProfileDefaults {
    pub timeout: Delays,
    pub retry: RetryPolicy,
    pub redirect: RedirectPolicy,
}

impl ClientProfile {
    pub fn defaults(self) -> ProfileDefaults {
        match self {
            Self::Standard => ProfileDefaults {
                timeout: Delays::default(),
                retry: RetryPolicy::standard(),
                redirect: RedirectPolicy::standard(),
            },
            Self::LowLatency => ProfileDefaults {
                timeout: Delays {
                    connect: Some(Duration::from_millis(500)),
                    response: Some(Duration::from_secs(2)),
                    request: Some(Duration::from_secs(5)),
                    ..Delays::default()
                },
                retry: RetryPolicy::standard()
                    .limit(1)
                    .backoff_limit(Duration::from_millis(300)),
                redirect: RedirectPolicy::limited(3),
            },
            Self::Bulk => ProfileDefaults {
                timeout: Delays {
                    connect: Some(Duration::from_secs(10)),
                    socket: Some(Duration::from_secs(60)),
                    request: Some(Duration::from_secs(300)),
                    ..Delays::default()
                },
                retry: RetryPolicy::standard()
                    .limit(4)
                    .backoff_limit(Duration::from_secs(30)),
                redirect: RedirectPolicy::standard(),
            },
        }
    }

    /// Client defaults seeded from this profile.
    pub fn to_defaults(self) -> Defaults {
        let profile = self.defaults();
        Defaults::default()
            .with_timeout(profile.timeout)
            .with_retry(profile.retry)
            .with_redirect(profile.redirect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_profile_matches_plain_defaults() {
        let defaults = ClientProfile::Standard.to_defaults();
        let plain = Defaults::default();
        assert_eq!(defaults.timeout(), plain.timeout());
        assert_eq!(defaults.retry().limit_value(), plain.retry().limit_value());
        assert_eq!(defaults.redirect(), plain.redirect());
    }

    #[test]
    fn low_latency_profile_bounds_every_request() {
        let defaults = ClientProfile::LowLatency.to_defaults();
        assert_eq!(defaults.timeout().request, Some(Duration::from_secs(5)));
        assert_eq!(defaults.retry().limit_value(), 1);
        assert_eq!(defaults.redirect().max_redirects(), 3);
    }
}
