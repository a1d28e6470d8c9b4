pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("vu cap can't be negative")]
    NegativeVuCap,

    #[error("vu count can't be negative")]
    NegativeVus,

    #[error("can't raise vu count (to {requested}) above vu cap ({cap})")]
    VuCapExceeded { requested: i64, cap: i64 },

    #[error("can't lower vu cap (to {requested}) below vu count ({current})")]
    VuCapBelowCount { requested: i64, current: i64 },

    #[error("executor is already running")]
    AlreadyRunning,

    #[error("invalid submetric `{metric}`: {source}")]
    Submetric {
        metric: String,
        #[source]
        source: stampede_metrics::submetric::Error,
    },

    #[error("virtual user error: {0}")]
    Vu(String),
}
