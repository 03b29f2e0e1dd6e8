use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ThreadError {
    #[snafu(display("thread id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
    #[snafu(display("last turn has no answer to rewrite"))]
    NothingToRewrite { stage: &'static str },
}

pub type ThreadResult<T> = Result<T, ThreadError>;
