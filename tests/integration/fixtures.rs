//! Test fixtures: mock collaborators and an orchestrator harness.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use conductor::branching::BranchingMode;
use conductor::collab::{
    CodeHost, CodingAgent, ConflictInfo, HostError, Issue, MergeOutcome, Plan, Resolution,
    Review, StatusReporter, TaskResult,
};
use conductor::core::task::Task;
use conductor::error::Result;
use conductor::orchestrator::Orchestrator;
use conductor::recovery::RecoveryCoordinator;
use conductor::state::{CheckpointStore, StateStore};
use conductor::workflow::{Stage, WorkflowId};
use conductor::Config;

/// In-memory code host with scriptable failures and conflicts.
pub struct MockCodeHost {
    issues: Mutex<HashMap<u64, Issue>>,
    pub comments: Mutex<Vec<(u64, String)>>,
    pub labels: Mutex<Vec<(u64, String)>>,
    pub branches: Mutex<HashSet<String>>,
    /// Queued failures returned by `get_issue` before it succeeds.
    get_issue_failures: Mutex<VecDeque<HostError>>,
    /// Head-branch substrings that conflict until resolved.
    conflicts: Mutex<Vec<String>>,
    resolved: Mutex<HashSet<String>>,
    /// When false, `merge_with_resolution` conflicts again.
    resolution_sticks: AtomicBool,
    pub merge_calls: Mutex<Vec<(String, String)>>,
    pub resolution_calls: Mutex<Vec<(String, String)>>,
    pub pull_requests: Mutex<Vec<(String, String, String, String)>>,
    commit_counter: AtomicU64,
}

impl MockCodeHost {
    pub fn new() -> Self {
        Self {
            issues: Mutex::new(HashMap::new()),
            comments: Mutex::new(Vec::new()),
            labels: Mutex::new(Vec::new()),
            branches: Mutex::new(HashSet::new()),
            get_issue_failures: Mutex::new(VecDeque::new()),
            conflicts: Mutex::new(Vec::new()),
            resolved: Mutex::new(HashSet::new()),
            resolution_sticks: AtomicBool::new(true),
            merge_calls: Mutex::new(Vec::new()),
            resolution_calls: Mutex::new(Vec::new()),
            pull_requests: Mutex::new(Vec::new()),
            commit_counter: AtomicU64::new(0),
        }
    }

    pub fn seed_issue(&self, number: u64, title: &str, body: &str) {
        self.issues.lock().unwrap().insert(
            number,
            Issue {
                number,
                title: title.to_string(),
                body: body.to_string(),
                labels: Vec::new(),
            },
        );
    }

    /// Queue failures that `get_issue` returns before succeeding.
    pub fn fail_get_issue(&self, failures: Vec<HostError>) {
        self.get_issue_failures.lock().unwrap().extend(failures);
    }

    /// Mark head branches containing `fragment` as conflicting until a
    /// resolution is applied.
    pub fn conflict_on(&self, fragment: &str) {
        self.conflicts.lock().unwrap().push(fragment.to_string());
    }

    /// Make resolutions ineffective: the conflict persists.
    pub fn resolutions_do_not_stick(&self) {
        self.resolution_sticks.store(false, Ordering::SeqCst);
    }

    fn next_commit(&self) -> String {
        format!(
            "commit-{:04}",
            self.commit_counter.fetch_add(1, Ordering::SeqCst)
        )
    }

    fn head_conflicts(&self, head: &str) -> bool {
        let resolved = self.resolved.lock().unwrap();
        if resolved.contains(head) {
            return false;
        }
        self.conflicts
            .lock()
            .unwrap()
            .iter()
            .any(|fragment| head.contains(fragment.as_str()))
    }
}

#[async_trait]
impl CodeHost for MockCodeHost {
    async fn get_issue(&self, number: u64) -> std::result::Result<Issue, HostError> {
        if let Some(failure) = self.get_issue_failures.lock().unwrap().pop_front() {
            return Err(failure);
        }
        self.issues
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .ok_or_else(|| HostError::NotFound(format!("issue {}", number)))
    }

    async fn create_issue(
        &self,
        title: &str,
        body: &str,
    ) -> std::result::Result<Issue, HostError> {
        let number = 1000 + self.issues.lock().unwrap().len() as u64;
        let issue = Issue {
            number,
            title: title.to_string(),
            body: body.to_string(),
            labels: Vec::new(),
        };
        self.issues.lock().unwrap().insert(number, issue.clone());
        Ok(issue)
    }

    async fn add_label(&self, number: u64, label: &str) -> std::result::Result<(), HostError> {
        self.labels.lock().unwrap().push((number, label.to_string()));
        Ok(())
    }

    async fn comment(&self, number: u64, body: &str) -> std::result::Result<(), HostError> {
        self.comments
            .lock()
            .unwrap()
            .push((number, body.to_string()));
        Ok(())
    }

    async fn create_branch(&self, name: &str, _from: &str) -> std::result::Result<(), HostError> {
        self.branches.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn branch_diff(
        &self,
        base: &str,
        head: &str,
    ) -> std::result::Result<String, HostError> {
        Ok(format!("diff --git {}...{}\n+changes from {}\n", base, head, head))
    }

    async fn merge_branch(
        &self,
        base: &str,
        head: &str,
    ) -> std::result::Result<MergeOutcome, HostError> {
        self.merge_calls
            .lock()
            .unwrap()
            .push((base.to_string(), head.to_string()));

        if self.head_conflicts(head) {
            return Ok(MergeOutcome::Conflict {
                diff: format!("<<<<<<< {}\n=======\n{}\n>>>>>>>", base, head),
            });
        }
        Ok(MergeOutcome::Merged {
            commit: self.next_commit(),
        })
    }

    async fn merge_with_resolution(
        &self,
        base: &str,
        head: &str,
        _resolution: &Resolution,
    ) -> std::result::Result<MergeOutcome, HostError> {
        self.resolution_calls
            .lock()
            .unwrap()
            .push((base.to_string(), head.to_string()));

        if !self.resolution_sticks.load(Ordering::SeqCst) {
            return Ok(MergeOutcome::Conflict {
                diff: format!("still conflicting: {}", head),
            });
        }
        self.resolved.lock().unwrap().insert(head.to_string());
        Ok(MergeOutcome::Merged {
            commit: self.next_commit(),
        })
    }

    async fn create_pull_request(
        &self,
        title: &str,
        body: &str,
        base: &str,
        head: &str,
    ) -> std::result::Result<u64, HostError> {
        let mut prs = self.pull_requests.lock().unwrap();
        prs.push((
            title.to_string(),
            body.to_string(),
            base.to_string(),
            head.to_string(),
        ));
        Ok(prs.len() as u64)
    }
}

/// Scriptable coding agent that records every call.
pub struct MockCodingAgent {
    /// Task names the agent fails to execute.
    failing_tasks: Mutex<HashSet<String>>,
    /// Scripted reviews, consumed front-first; empty means approve.
    reviews: Mutex<VecDeque<Review>>,
    /// Custom (name, dependency-names) decomposition; None means the
    /// default task-1 <- task-2 <- task-3 chain.
    prompts: Mutex<Option<Vec<(String, Vec<String>)>>>,
    pub executed: Mutex<Vec<String>>,
    pub reviewed_diffs: Mutex<Vec<String>>,
    pub resolve_calls: Mutex<Vec<ConflictInfo>>,
}

impl MockCodingAgent {
    pub fn new() -> Self {
        Self {
            failing_tasks: Mutex::new(HashSet::new()),
            reviews: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(None),
            executed: Mutex::new(Vec::new()),
            reviewed_diffs: Mutex::new(Vec::new()),
            resolve_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_task(&self, name: &str) {
        self.failing_tasks.lock().unwrap().insert(name.to_string());
    }

    pub fn script_review(&self, review: Review) {
        self.reviews.lock().unwrap().push_back(review);
    }

    pub fn script_prompts(&self, specs: Vec<(&str, Vec<&str>)>) {
        let owned = specs
            .into_iter()
            .map(|(name, deps)| {
                (
                    name.to_string(),
                    deps.into_iter().map(String::from).collect(),
                )
            })
            .collect();
        *self.prompts.lock().unwrap() = Some(owned);
    }

    fn build_tasks(&self, plan: &Plan) -> Vec<Task> {
        let specs: Vec<(String, Vec<String>)> =
            self.prompts.lock().unwrap().clone().unwrap_or_else(|| {
                vec![
                    ("task-1".to_string(), vec![]),
                    ("task-2".to_string(), vec!["task-1".to_string()]),
                    (
                        "task-3".to_string(),
                        vec!["task-1".to_string(), "task-2".to_string()],
                    ),
                ]
            });

        // Two passes so dependencies may reference any task, including
        // forward references and (deliberately broken) self-cycles.
        let mut by_name = HashMap::new();
        let mut tasks = Vec::new();
        for (name, _) in &specs {
            let task = Task::new(plan.id, name, &format!("Implement {}", name));
            by_name.insert(name.clone(), task.id);
            tasks.push(task);
        }
        for (task, (_, deps)) in tasks.iter_mut().zip(&specs) {
            for dep in deps {
                if let Some(id) = by_name.get(dep) {
                    task.depends_on.push(*id);
                }
            }
        }
        tasks
    }
}

#[async_trait]
impl CodingAgent for MockCodingAgent {
    async fn generate_plan(&self, issue: &Issue) -> Result<Plan> {
        Ok(Plan::new(
            &issue.title,
            &format!("Plan for: {}\n1. model\n2. api\n3. tests", issue.body),
        ))
    }

    async fn generate_prompts(&self, plan: &Plan) -> Result<Vec<Task>> {
        Ok(self.build_tasks(plan))
    }

    async fn execute_task(&self, task: &Task, _context: &str) -> Result<TaskResult> {
        self.executed.lock().unwrap().push(task.name.clone());
        if self.failing_tasks.lock().unwrap().contains(&task.name) {
            return Err(conductor::Error::AgentCall(format!(
                "agent could not complete {}",
                task.name
            )));
        }
        Ok(TaskResult {
            task: task.id,
            summary: format!("implemented {}", task.name),
            commit: Some(format!("c-{}", task.name)),
        })
    }

    async fn review_code(&self, diff: &str, _context: &str) -> Result<Review> {
        self.reviewed_diffs.lock().unwrap().push(diff.to_string());
        Ok(self.reviews.lock().unwrap().pop_front().unwrap_or(Review {
            approved: true,
            feedback: "looks good".to_string(),
        }))
    }

    async fn resolve_conflict(&self, info: &ConflictInfo) -> Result<Resolution> {
        self.resolve_calls.lock().unwrap().push(info.clone());
        Ok(Resolution {
            message: format!("resolve conflict merging {} into {}", info.head, info.base),
            patch: format!("patched:{}", info.head),
        })
    }
}

/// Reporter that records every notice.
pub struct MockReporter {
    pub progress_notices: Mutex<Vec<(WorkflowId, String)>>,
    pub failure_notices: Mutex<Vec<(WorkflowId, String)>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self {
            progress_notices: Mutex::new(Vec::new()),
            failure_notices: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl StatusReporter for MockReporter {
    async fn progress(&self, workflow: WorkflowId, message: &str) -> Result<()> {
        self.progress_notices
            .lock()
            .unwrap()
            .push((workflow, message.to_string()));
        Ok(())
    }

    async fn failure(&self, workflow: WorkflowId, message: &str) -> Result<()> {
        self.failure_notices
            .lock()
            .unwrap()
            .push((workflow, message.to_string()));
        Ok(())
    }
}

/// A fully wired orchestrator over temp-dir stores and mocks.
pub struct Harness {
    #[allow(dead_code)]
    dir: TempDir,
    pub orchestrator: Orchestrator,
    pub host: Arc<MockCodeHost>,
    pub agent: Arc<MockCodingAgent>,
    pub reporter: Arc<MockReporter>,
    pub store: Arc<StateStore>,
    pub checkpoints: Arc<CheckpointStore>,
    pub recovery: Arc<RecoveryCoordinator>,
}

impl Harness {
    pub fn new(branching: BranchingMode) -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let config = Config {
            data_dir: Some(dir.path().to_string_lossy().into_owned()),
            max_workers: 2,
            task_timeout_secs: 30,
            lock_timeout_ms: 500,
            retry_max_attempts: 2,
            retry_base_delay_ms: 1,
            checkpoint_max_age_days: None,
            branching,
            base_branch: "main".to_string(),
        };

        let store =
            Arc::new(StateStore::new(dir.path(), config.lock_timeout()).expect("state store"));
        let checkpoints = Arc::new(CheckpointStore::new(dir.path()).expect("checkpoint store"));
        let host = Arc::new(MockCodeHost::new());
        let agent = Arc::new(MockCodingAgent::new());
        let reporter = Arc::new(MockReporter::new());

        let recovery = Arc::new(
            RecoveryCoordinator::with_default_strategies(
                Arc::clone(&checkpoints),
                Arc::clone(&host) as _,
                Arc::clone(&agent) as _,
                Arc::clone(&reporter) as _,
                &config,
                dir.path(),
            )
            .expect("recovery coordinator"),
        );

        let orchestrator = Orchestrator::new(
            Arc::clone(&store),
            Arc::clone(&checkpoints),
            Arc::clone(&recovery),
            Arc::clone(&host) as _,
            Arc::clone(&agent) as _,
            Arc::clone(&reporter) as _,
            config,
        );

        Self {
            dir,
            orchestrator,
            host,
            agent,
            reporter,
            store,
            checkpoints,
            recovery,
        }
    }

    /// Seed issue #7 and create a workflow for it.
    pub async fn create_workflow(&self) -> WorkflowId {
        self.create_labeled_workflow(vec![]).await
    }

    pub async fn create_labeled_workflow(&self, labels: Vec<String>) -> WorkflowId {
        self.host
            .seed_issue(7, "Add widget support", "Widgets need CRUD endpoints");
        self.orchestrator
            .create_workflow(7, labels)
            .await
            .expect("create workflow")
    }

    /// Process stages in order up to and including `through`.
    pub async fn run_through(&self, id: WorkflowId, through: Stage) {
        for stage in Stage::ALL {
            self.orchestrator
                .process(id, stage)
                .await
                .unwrap_or_else(|e| panic!("stage {} failed: {}", stage, e));
            if stage == through {
                break;
            }
        }
    }
}
