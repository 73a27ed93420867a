//! Small helpers shared across the crate.

/// Returns `Err($error)` from the enclosing function unless `$predicate` holds.
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error);
        }
    };
}

pub(crate) use ensure;
