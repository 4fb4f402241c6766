pub mod api_client;
pub mod captcha;
pub mod coordinates;
pub mod extract;
pub mod map_ledger;
pub mod notifier;
pub mod queue;
pub mod report;
pub mod submit;

pub use api_client::{ApiCloudClient, RecordSource};
pub use captcha::CaptchaRecognizer;
pub use map_ledger::{MapOutcome, MapTaskLedger};
pub use notifier::Notifier;
pub use queue::TaskQueue;
pub use report::ReportAssembler;
