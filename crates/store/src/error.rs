use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    /// The backing store could not be reached or the operation did not complete.
    #[snafu(display("store unavailable on `{stage}`: {details}"))]
    Unavailable { stage: &'static str, details: String },
    /// The backing store refused the operation.
    #[snafu(display("store denied `{stage}`: {details}"))]
    Denied { stage: &'static str, details: String },
    #[snafu(display("store id '{raw}' is not a valid {id_kind}"))]
    InvalidId {
        stage: &'static str,
        id_kind: &'static str,
        raw: String,
        source: uuid::Error,
    },
}

impl StoreError {
    /// Maps an IO failure onto the contract taxonomy. Permission problems are
    /// `Denied`; everything else means the backing could not be reached.
    pub(crate) fn from_io(stage: &'static str, source: &std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            Self::Denied {
                stage,
                details: source.to_string(),
            }
        } else {
            Self::Unavailable {
                stage,
                details: source.to_string(),
            }
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
