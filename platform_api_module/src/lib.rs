//! Outbound side of the steward: everything that talks to the hosting
//! platform's REST API on behalf of one installation.

pub mod clock;
pub mod github;
pub mod installation;
pub mod response;
pub mod transport;

pub use clock::{Clock, SystemClock};
pub use github::{GithubApi, IssueRef};
pub use installation::{
    ApiError, AppCredentials, Auth, InstallationManager, ManagerOptions, PacedRequester,
    DEFAULT_API_BASE_URL,
};
pub use response::{ApiResponse, ResponseBody};
pub use transport::{Method, RawResponse, ReqwestTransport, Transport, TransportError};
