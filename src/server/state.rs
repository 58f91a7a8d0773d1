use crate::job::JobRegistry;
use crate::pipeline::Pipeline;
use crate::settings;

#[derive(Clone)]
pub(crate) struct ServerState {
    pub(crate) settings: settings::Settings,
    pub(crate) registry: std::sync::Arc<JobRegistry>,
    pub(crate) pipeline: Pipeline,
}
