//! Intentionally empty: this crate exists only to host the integration
//! tests in `tests/`, exercising `esrc-core`, `esrc-postgres` and
//! `esrc-redis` together.
