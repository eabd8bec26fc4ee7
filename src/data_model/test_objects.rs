pub mod tests {
    use crate::data_model::{
        RunState, Task, TaskBuilder, TaskRun, TaskRunBuilder,
    };

    pub const TEST_TASK_ID: &str = "fQyGTTVlRRCy-UASypzfkw";
    pub const TEST_WORKER_GROUP: &str = "test-worker-group";
    pub const TEST_WORKER_ID: &str = "test-worker";

    pub fn running_run() -> TaskRun {
        TaskRunBuilder::default()
            .state(RunState::Running)
            .worker_group(Some(TEST_WORKER_GROUP.to_string()))
            .worker_id(Some(TEST_WORKER_ID.to_string()))
            .build()
            .unwrap()
    }

    pub fn mock_task(expires: u64) -> Task {
        TaskBuilder::default()
            .task_id(TEST_TASK_ID.to_string())
            .expires(expires)
            .routes(vec!["index.project.test".to_string()])
            .runs(vec![running_run()])
            .build()
            .unwrap()
    }
}
