use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StreamError {
    #[snafu(display("backend transport failed on `{stage}`, {source}"))]
    Network {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("backend returned status {status}: {body}"))]
    Backend {
        stage: &'static str,
        status: u16,
        body: String,
    },
}

impl StreamError {
    /// Short user-facing description, without transport internals.
    pub fn user_message(&self) -> String {
        match self {
            Self::Network { .. } => "Something went wrong. Please try again later.".to_string(),
            Self::Backend { status, .. } => {
                format!("The answer service returned an error (status {status}).")
            }
        }
    }
}

pub type StreamResult<T> = Result<T, StreamError>;
