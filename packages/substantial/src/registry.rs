use std::{
	collections::HashMap,
	sync::{Arc, PoisonError, RwLock},
};

use crate::{
	error::{WorkflowError, WorkflowResult},
	workflow::{workflow_name_of_run, Workflow},
};

/// Process-wide workflow registry, written at register time and read at start
/// and on each replay.
#[derive(Default)]
pub struct Registry {
	workflows: RwLock<HashMap<String, Workflow>>,
}

pub type RegistryHandle = Arc<Registry>;

impl Registry {
	pub fn register(&self, workflow: Workflow) -> WorkflowResult<()> {
		let mut workflows = self
			.workflows
			.write()
			.unwrap_or_else(PoisonError::into_inner);

		if workflows.contains_key(workflow.name()) {
			return Err(WorkflowError::DuplicateRegisteredWorkflow(
				workflow.name().to_string(),
			));
		}

		workflows.insert(workflow.name().to_string(), workflow);

		Ok(())
	}

	pub fn get(&self, name: &str) -> WorkflowResult<Workflow> {
		self.workflows
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.get(name)
			.cloned()
			.ok_or_else(|| WorkflowError::WorkflowMissingFromRegistry(name.to_string()))
	}

	/// Resolves the workflow a run belongs to from the run id prefix.
	pub fn resolve_run(&self, run_id: &str) -> WorkflowResult<Workflow> {
		self.get(workflow_name_of_run(run_id)?)
	}

	pub fn size(&self) -> usize {
		self.workflows
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.len()
	}
}
