//! Run reconciliation
//!
//! Every run of the test process assigns fresh ids to the tests it discovers.
//! [`ReconciliationStore`] folds the relayed `found`/`start`/`end` stream into a
//! persistent [`TestTree`] whose ids survive re-runs:
//!
//! - In a full run the reported id is trusted as the stable id.
//! - In a filtered run each discovered node is matched against the existing
//!   tree (same scope, name and kind; roots also by file) and the run's
//!   [`RunIdentityMap`] records which stable id the fresh id stands for.
//!
//! The identity map lives exactly one run. The tree itself is plain data.

use crate::console::{ConsoleEntry, ConsoleLog};
use crate::pattern::{build_test_name_pattern, coerce_elapsed, normalize_file_path, normalize_optional};
use crate::protocol::{FileChangeInfo, RelayMessage, RunRequest, TestError};
use crate::types::{
    is_skip_status, ConsolePayload, EndParams, FoundParams, RunPhase, StartParams, TestKind,
    TestNode, TestStatus, TestSummary,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Persistent test tree keyed by stable id
#[derive(Debug, Clone, Default)]
pub struct TestTree {
    nodes: HashMap<String, TestNode>,
    roots: Vec<String>,
}

impl TestTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&TestNode> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut TestNode> {
        self.nodes.get_mut(id)
    }

    /// Ids of parentless nodes, in first-discovery order
    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TestNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Create or update a discovered node and link it into its parent or the root list.
    ///
    /// A parent that is not known yet gets a placeholder group. A node that
    /// moved is unlinked from its previous parent or the root list.
    pub fn upsert(
        &mut self,
        id: &str,
        name: &str,
        kind: TestKind,
        parent_id: Option<&str>,
        url: Option<&str>,
        line: Option<u32>,
    ) {
        if let Some(previous) = self.nodes.get(id).map(|n| n.parent_id.clone()) {
            if previous.as_deref() != parent_id {
                self.unlink(id, previous.as_deref());
            }
        }

        let node = self
            .nodes
            .entry(id.to_string())
            .or_insert_with(|| TestNode::new(id, name, kind));
        node.name = name.to_string();
        node.kind = kind;
        node.parent_id = parent_id.map(str::to_string);
        node.url = url.map(str::to_string);
        node.line = line;

        match parent_id {
            Some(parent_id) => {
                self.nodes
                    .entry(parent_id.to_string())
                    .or_insert_with(|| TestNode::placeholder_group(parent_id))
                    .add_child(id);
            }
            None => {
                if !self.roots.iter().any(|r| r == id) {
                    self.roots.push(id.to_string());
                }
            }
        }
    }

    fn unlink(&mut self, id: &str, parent_id: Option<&str>) {
        match parent_id {
            Some(parent_id) => {
                if let Some(parent) = self.nodes.get_mut(parent_id) {
                    parent.children.retain(|c| c != id);
                }
            }
            None => self.roots.retain(|r| r != id),
        }
    }

    /// Drop every node outside `keep` that is not an ancestor of a kept node.
    ///
    /// Returns how many nodes were removed.
    pub fn prune(&mut self, keep: &HashSet<String>) -> usize {
        let mut live: HashSet<String> = HashSet::new();
        for id in keep {
            let mut cursor = Some(id.as_str());
            while let Some(id) = cursor {
                if !live.insert(id.to_string()) {
                    break;
                }
                cursor = self.nodes.get(id).and_then(|n| n.parent_id.as_deref());
            }
        }

        let before = self.nodes.len();
        self.nodes.retain(|id, _| live.contains(id));
        self.roots.retain(|id| live.contains(id));
        for node in self.nodes.values_mut() {
            node.children.retain(|c| live.contains(c));
        }
        before - self.nodes.len()
    }

    /// Node for `id`, creating a placeholder test if it was never discovered.
    pub fn ensure_test(&mut self, id: &str) -> &mut TestNode {
        self.nodes
            .entry(id.to_string())
            .or_insert_with(|| TestNode::placeholder_test(id))
    }

    /// Existing node in the given scope (children of `parent_id`, or the roots)
    /// with the same name and kind. Roots must also agree on the file.
    pub fn find_in_scope(
        &self,
        name: &str,
        kind: TestKind,
        url: Option<&str>,
        parent_id: Option<&str>,
    ) -> Option<String> {
        let scope: &[String] = match parent_id {
            Some(parent_id) => self
                .nodes
                .get(parent_id)
                .map(|p| p.children.as_slice())
                .unwrap_or_default(),
            None => &self.roots,
        };
        let wanted_file = normalize_optional(url);

        scope
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .find(|candidate| {
                candidate.name == name
                    && candidate.kind == kind
                    && (parent_id.is_some()
                        || normalize_optional(candidate.url.as_deref()) == wanted_file)
            })
            .map(|candidate| candidate.id.clone())
    }

    /// Status of a node with group results derived from their descendants.
    ///
    /// Precedence: running, then failed/timeout, then passed (all settled and
    /// at least one passed), then skipped (all settled), otherwise idle.
    pub fn aggregate_status(&self, id: &str) -> TestStatus {
        let mut visiting = HashSet::new();
        self.aggregate_inner(id, &mut visiting)
    }

    fn aggregate_inner<'a>(&'a self, id: &'a str, visiting: &mut HashSet<&'a str>) -> TestStatus {
        let Some(node) = self.nodes.get(id) else {
            return TestStatus::Idle;
        };
        if node.kind == TestKind::Test || node.children.is_empty() {
            return node.status;
        }
        if !visiting.insert(id) {
            return node.status;
        }

        let statuses: Vec<TestStatus> = node
            .children
            .iter()
            .filter(|child| self.nodes.contains_key(child.as_str()))
            .map(|child| self.aggregate_inner(child, visiting))
            .collect();
        visiting.remove(id);

        if statuses.is_empty() {
            return node.status;
        }
        if statuses.contains(&TestStatus::Running) {
            return TestStatus::Running;
        }
        if statuses.iter().any(|s| s.is_failure()) {
            return TestStatus::Failed;
        }
        if statuses.iter().all(|s| s.is_settled_ok()) {
            return if statuses.contains(&TestStatus::Passed) {
                TestStatus::Passed
            } else {
                TestStatus::Skipped
            };
        }
        TestStatus::Idle
    }

    /// Breadcrumb of names from the outermost group down to `id`.
    pub fn test_path(&self, id: &str) -> Option<Vec<String>> {
        let mut current = self.nodes.get(id)?;
        let mut path = Vec::new();
        let mut seen = HashSet::new();

        loop {
            if !seen.insert(current.id.as_str()) {
                break;
            }
            let name = if current.name.is_empty() { "Test" } else { current.name.as_str() };
            path.push(name.to_string());
            match current.parent_id.as_deref().and_then(|p| self.nodes.get(p)) {
                Some(parent) => current = parent,
                None => break,
            }
        }

        path.reverse();
        Some(path)
    }

    /// Every test leaf under `root_id` (inclusive), in discovery order.
    pub fn collect_leaf_tests(&self, root_id: &str) -> Vec<LeafSelection> {
        let mut leaves = Vec::new();
        let mut stack = vec![root_id];
        let mut seen = HashSet::new();

        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            if node.kind == TestKind::Test {
                leaves.push(LeafSelection {
                    id: node.id.clone(),
                    file: normalize_optional(node.url.as_deref()),
                    path: self.test_path(id).unwrap_or_else(|| vec![node.name.clone()]),
                });
            }
            stack.extend(node.children.iter().rev().map(String::as_str));
        }

        leaves
    }

    fn reset_results<'a>(&mut self, ids: impl IntoIterator<Item = &'a String>) {
        for id in ids {
            if let Some(node) = self.nodes.get_mut(id) {
                node.reset_result();
            }
        }
    }

    fn reset_all_results(&mut self) {
        for node in self.nodes.values_mut() {
            node.reset_result();
        }
    }
}

/// A test leaf picked for a re-run
#[derive(Debug, Clone, PartialEq)]
pub struct LeafSelection {
    pub id: String,
    pub file: Option<String>,
    pub path: Vec<String>,
}

/// Ephemeral id of the current run -> stable tree id
#[derive(Debug, Clone, Default)]
pub struct RunIdentityMap {
    ids: HashMap<String, String>,
}

impl RunIdentityMap {
    pub fn insert(&mut self, ephemeral: &str, stable: &str) {
        self.ids.insert(ephemeral.to_string(), stable.to_string());
    }

    pub fn get(&self, ephemeral: &str) -> Option<&str> {
        self.ids.get(ephemeral).map(String::as_str)
    }

    /// Stable id for `ephemeral`, or the ephemeral id itself when unmapped.
    pub fn resolve(&self, ephemeral: &str) -> String {
        self.get(ephemeral).unwrap_or(ephemeral).to_string()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// What to run next, as decided on the client side
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOptions {
    pub files: Vec<String>,
    pub test_name_pattern: Option<String>,
    /// Defaults to "reset" for unfiltered runs and "keep" for filtered ones
    pub reset_state: Option<bool>,
    /// Stable ids the run is aimed at
    pub target_ids: Vec<String>,
}

impl RunOptions {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn has_filter(&self) -> bool {
        !self.files.is_empty() || self.test_name_pattern.as_deref().is_some_and(|p| !p.is_empty())
    }

    /// Filtered run aimed at the given leaves
    pub fn for_selection(selection: &[LeafSelection]) -> Self {
        let mut files: Vec<String> = Vec::new();
        for file in selection.iter().filter_map(|leaf| leaf.file.as_ref()) {
            if !files.contains(file) {
                files.push(file.clone());
            }
        }
        let paths: Vec<Vec<String>> = selection.iter().map(|leaf| leaf.path.clone()).collect();

        Self {
            files,
            test_name_pattern: build_test_name_pattern(&paths),
            reset_state: Some(false),
            target_ids: selection.iter().map(|leaf| leaf.id.clone()).collect(),
        }
    }
}

/// Client-side state of the test tree across runs
#[derive(Debug)]
pub struct ReconciliationStore {
    tree: TestTree,
    identities: RunIdentityMap,
    filtered: bool,
    targeted: HashSet<String>,
    /// Run ids referenced as a parent before their own `found`
    early_parents: HashSet<String>,
    /// Neither files nor a name filter: whatever is not reported is gone
    full_run: bool,
    /// Stable ids the current run reported
    reported: HashSet<String>,
    started_at: HashMap<String, Instant>,
    active_test: Option<String>,
    console: ConsoleLog,
    phase: RunPhase,
    run_started: Option<Instant>,
    run_duration: Option<Duration>,
}

impl ReconciliationStore {
    pub fn new() -> Self {
        Self {
            tree: TestTree::new(),
            identities: RunIdentityMap::default(),
            filtered: false,
            targeted: HashSet::new(),
            early_parents: HashSet::new(),
            full_run: false,
            reported: HashSet::new(),
            started_at: HashMap::new(),
            active_test: None,
            console: ConsoleLog::new(),
            phase: RunPhase::Idle,
            run_started: None,
            run_duration: None,
        }
    }

    pub fn tree(&self) -> &TestTree {
        &self.tree
    }

    pub fn node(&self, id: &str) -> Option<&TestNode> {
        self.tree.get(id)
    }

    pub fn roots(&self) -> &[String] {
        self.tree.roots()
    }

    pub fn identities(&self) -> &RunIdentityMap {
        &self.identities
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn is_filtered_run(&self) -> bool {
        self.filtered
    }

    pub fn active_test(&self) -> Option<&str> {
        self.active_test.as_deref()
    }

    pub fn console_entries(&self) -> impl Iterator<Item = &ConsoleEntry> {
        self.console.entries()
    }

    pub fn aggregate_status(&self, id: &str) -> TestStatus {
        self.tree.aggregate_status(id)
    }

    /// Prepare for a new run and return the command to send to the daemon.
    ///
    /// With nothing to reconcile against, a filtered run is treated like a
    /// full one.
    pub fn begin_run(&mut self, options: RunOptions) -> RunRequest {
        let reset_state =
            options.reset_state.unwrap_or(!options.has_filter()) || self.tree.is_empty();

        self.active_test = None;
        self.console.clear();
        self.phase = RunPhase::Running;
        self.run_duration = None;
        self.run_started = Some(Instant::now());
        self.started_at.clear();

        self.identities.clear();
        self.early_parents.clear();
        self.reported.clear();
        self.full_run = reset_state && !options.has_filter();
        self.filtered = !reset_state;
        self.targeted = options.target_ids.iter().cloned().collect();

        if reset_state {
            self.tree.reset_all_results();
        } else {
            self.tree.reset_results(&options.target_ids);
        }

        debug!(
            filtered = self.filtered,
            targets = self.targeted.len(),
            "Beginning run"
        );

        RunRequest {
            files: (!options.files.is_empty()).then_some(options.files),
            test_name_pattern: options.test_name_pattern.filter(|p| !p.is_empty()),
        }
    }

    /// Fold one relayed message into the store.
    ///
    /// Returns the follow-up run a `file-changed` notification asks for.
    pub fn apply(&mut self, message: &RelayMessage) -> Option<RunOptions> {
        match message {
            RelayMessage::Found(data) => {
                if let Some(params) = parse::<FoundParams>("found", data) {
                    self.on_found(&params);
                }
            }
            RelayMessage::Start(data) => {
                if let Some(params) = parse::<StartParams>("start", data) {
                    self.on_start(&params);
                }
            }
            RelayMessage::End(data) => {
                if let Some(params) = parse::<EndParams>("end", data) {
                    self.on_end(&params);
                }
            }
            RelayMessage::Console(data) => {
                if let Some(payload) = parse::<ConsolePayload>("console", data) {
                    self.on_console(&payload);
                }
            }
            RelayMessage::Error(error) => self.on_error(error),
            RelayMessage::Exit(_) => self.on_exit(),
            RelayMessage::FileChanged(info) => return Some(self.on_file_changed(info)),
            RelayMessage::Output(_) => {}
        }
        None
    }

    pub fn on_found(&mut self, params: &FoundParams) {
        self.ensure_run_timer();
        let ephemeral = params.id.as_str();

        if !self.filtered {
            self.identities.insert(ephemeral, ephemeral);
            self.reported.insert(ephemeral.to_string());
            self.tree.upsert(
                ephemeral,
                &params.name,
                params.kind,
                params.parent_id.as_deref(),
                params.url.as_deref(),
                params.line,
            );
            return;
        }

        // A parent not seen yet in this run keeps its run id; the subtree is
        // then added as reported instead of merged.
        let parent_stable = params.parent_id.as_deref().map(|p| match self.identities.get(p) {
            Some(stable) => stable.to_string(),
            None => {
                self.early_parents.insert(p.to_string());
                p.to_string()
            }
        });

        let existing = if self.early_parents.contains(ephemeral) {
            None
        } else {
            self.tree.find_in_scope(
                &params.name,
                params.kind,
                params.url.as_deref(),
                parent_stable.as_deref(),
            )
        };

        match existing {
            Some(stable) => {
                trace!("Run id {} maps to {}", ephemeral, stable);
                self.identities.insert(ephemeral, &stable);
                if let Some(node) = self.tree.get_mut(&stable) {
                    if params.url.is_some() {
                        node.url = params.url.clone();
                    }
                    if params.line.is_some() {
                        node.line = params.line;
                    }
                }
            }
            None => {
                debug!(
                    "No existing node for {:?} in filtered run, adding as {}",
                    params.name, ephemeral
                );
                self.identities.insert(ephemeral, ephemeral);
                self.tree.upsert(
                    ephemeral,
                    &params.name,
                    params.kind,
                    parent_stable.as_deref(),
                    params.url.as_deref(),
                    params.line,
                );
            }
        }
    }

    pub fn on_start(&mut self, params: &StartParams) {
        self.ensure_run_timer();
        let stable = self.identities.resolve(&params.id);

        let node = self.tree.ensure_test(&stable);
        node.status = TestStatus::Running;
        self.reported.insert(stable.clone());
        self.started_at.insert(stable.clone(), Instant::now());
        self.active_test = Some(stable);
    }

    pub fn on_end(&mut self, params: &EndParams) {
        self.ensure_run_timer();
        let stable = self.identities.resolve(&params.id);

        if self.filtered {
            let is_group = self
                .tree
                .get(&stable)
                .is_some_and(|node| node.kind == TestKind::Describe);
            if is_group {
                return;
            }
            // The runner walks non-targeted siblings and reports them skipped.
            if is_skip_status(&params.status) && !self.targeted.contains(&stable) {
                trace!("Ignoring skip for untargeted {}", stable);
                return;
            }
        }

        let duration = match coerce_elapsed(&params.elapsed) {
            Some(elapsed) if elapsed > 0.0 => Some(elapsed),
            _ => self
                .started_at
                .get(&stable)
                .map(|started| started.elapsed().as_secs_f64() * 1000.0),
        };
        let error = params.error_message();
        self.reported.insert(stable.clone());

        let node = self.tree.ensure_test(&stable);
        node.status = TestStatus::from_reported(&params.status);
        node.duration = duration;
        if error.is_some() {
            node.error = error;
        }

        if self.active_test.as_deref() == Some(stable.as_str()) {
            self.active_test = None;
        }
    }

    pub fn on_console(&mut self, payload: &ConsolePayload) {
        self.console.record(payload, self.active_test.clone());
    }

    pub fn on_error(&mut self, error: &TestError) {
        match &error.test_id {
            Some(test_id) => {
                let stable = self.identities.resolve(test_id);
                self.tree.ensure_test(&stable).error = Some(error.message.clone());
            }
            None => {
                self.console
                    .record_line("error", &error.message, self.active_test.clone());
            }
        }
    }

    /// Finish the run. A full run drops tests it no longer reported.
    pub fn on_exit(&mut self) {
        if let Some(started) = self.run_started.take() {
            self.run_duration = Some(started.elapsed());
        }
        if self.full_run && !self.reported.is_empty() {
            let pruned = self.tree.prune(&self.reported);
            if pruned > 0 {
                debug!(pruned, "Dropped tests missing from the full run");
            }
        }
        self.full_run = false;
        self.active_test = None;
        self.phase = RunPhase::Done;
    }

    /// Decide what a changed file should re-run.
    ///
    /// Known test files re-run their previously discovered tests; anything
    /// else triggers a full run.
    pub fn on_file_changed(&self, info: &FileChangeInfo) -> RunOptions {
        let changed = normalize_file_path(&info.full_path);
        let Some(changed) = changed.filter(|_| info.is_test_file) else {
            return RunOptions::full();
        };

        let file_roots: Vec<&String> = self
            .tree
            .roots()
            .iter()
            .filter(|id| {
                self.tree
                    .get(id)
                    .is_some_and(|root| normalize_optional(root.url.as_deref()).as_ref() == Some(&changed))
            })
            .collect();

        if file_roots.is_empty() {
            return RunOptions::full();
        }

        let selection: Vec<LeafSelection> = file_roots
            .iter()
            .flat_map(|id| self.tree.collect_leaf_tests(id))
            .collect();

        if selection.is_empty() {
            return RunOptions {
                files: vec![changed],
                test_name_pattern: None,
                reset_state: Some(false),
                target_ids: file_roots.into_iter().cloned().collect(),
            };
        }
        RunOptions::for_selection(&selection)
    }

    /// Options that re-run one node (a test or a whole group).
    pub fn selection_for(&self, id: &str) -> RunOptions {
        let selection = self.tree.collect_leaf_tests(id);
        if !selection.is_empty() {
            return RunOptions::for_selection(&selection);
        }

        let node = self.tree.get(id);
        RunOptions {
            files: node
                .and_then(|n| normalize_optional(n.url.as_deref()))
                .into_iter()
                .collect(),
            test_name_pattern: None,
            reset_state: Some(false),
            target_ids: node.map(|n| n.id.clone()).into_iter().collect(),
        }
    }

    /// Counts over test leaves plus the run's wall time.
    pub fn summary(&self) -> TestSummary {
        let mut summary = TestSummary::default();
        for node in self.tree.nodes().filter(|n| n.kind == TestKind::Test) {
            summary.total += 1;
            match node.status {
                TestStatus::Passed => summary.passed += 1,
                TestStatus::Failed | TestStatus::Timeout => summary.failed += 1,
                TestStatus::Skipped | TestStatus::Todo => summary.skipped += 1,
                TestStatus::Running => summary.running += 1,
                TestStatus::Idle => {}
            }
        }
        summary.duration_ms = match (self.run_duration, self.run_started) {
            (Some(duration), _) => duration.as_secs_f64() * 1000.0,
            (None, Some(started)) => started.elapsed().as_secs_f64() * 1000.0,
            (None, None) => 0.0,
        };
        summary
    }

    fn ensure_run_timer(&mut self) {
        if self.run_started.is_none() {
            self.run_started = Some(Instant::now());
            self.phase = RunPhase::Running;
        }
    }
}

impl Default for ReconciliationStore {
    fn default() -> Self {
        Self::new()
    }
}

fn parse<T: DeserializeOwned>(kind: &str, data: &Value) -> Option<T> {
    match serde_json::from_value(data.clone()) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            debug!("Dropping malformed {} payload: {}", kind, e);
            None
        }
    }
}
