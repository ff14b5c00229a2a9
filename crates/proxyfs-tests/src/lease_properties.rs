//! Property checks for the lease protocol: mutual exclusion, fairness,
//! minimum lifetime, idempotence, and identifier round-trips.
