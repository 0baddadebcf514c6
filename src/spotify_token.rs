use chrono::{DateTime, Duration, Utc};

use crate::models::AccessTokenResponse;

/// App-level Spotify access token obtained through the client credentials flow
pub struct SpotifyTokenData {
    pub token: String,
    pub expiry: DateTime<Utc>,
}

impl SpotifyTokenData {
    /// Starts out expired so that the first `get` fetches a real token.
    pub fn new() -> Self {
        SpotifyTokenData {
            token: String::new(),
            expiry: Utc::now(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool { self.token.is_empty() || now >= self.expiry }

    /// Stores a freshly fetched token.  The expiry is pulled in by 10 seconds so that we never hand out a token
    /// that expires while a request is in flight.
    pub fn set(&mut self, res: AccessTokenResponse, now: DateTime<Utc>) {
        let AccessTokenResponse {
            access_token,
            expires_in,
            ..
        } = res;
        self.token = access_token;
        self.expiry = now + Duration::seconds(expires_in - 10);
    }

    pub fn get(&self, now: DateTime<Utc>) -> Option<&str> {
        if self.is_expired(now) {
            None
        } else {
            Some(&self.token)
        }
    }

    pub fn invalidate(&mut self) { self.token.clear(); }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_response(expires_in: i64) -> AccessTokenResponse {
        AccessTokenResponse {
            access_token: "abc".into(),
            token_type: "Bearer".into(),
            expires_in,
        }
    }

    #[test]
    fn new_token_is_expired() {
        let data = SpotifyTokenData::new();
        assert!(data.is_expired(Utc::now()));
        assert_eq!(data.get(Utc::now()), None);
    }

    #[test]
    fn token_valid_until_ten_seconds_before_expiry() {
        let now = Utc::now();
        let mut data = SpotifyTokenData::new();
        data.set(token_response(3600), now);

        assert_eq!(data.get(now), Some("abc"));
        assert_eq!(data.get(now + Duration::seconds(3589)), Some("abc"));
        assert_eq!(data.get(now + Duration::seconds(3590)), None);
    }

    #[test]
    fn invalidated_token_is_expired() {
        let now = Utc::now();
        let mut data = SpotifyTokenData::new();
        data.set(token_response(3600), now);
        data.invalidate();
        assert!(data.is_expired(now));
    }
}
