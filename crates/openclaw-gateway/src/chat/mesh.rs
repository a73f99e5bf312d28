//! `mesh.run` / `mesh.status` / `mesh.cancel` / `mesh.retry` — the
//! multi-step workflow surface (§4.8). A mesh plan is a DAG of steps, each
//! driven through the same `chat::run::execute_run` machinery a single
//! `chat.send` call uses, capped at `maxParallel` concurrent steps.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use openclaw_protocol::frames::ResFrame;

use crate::app::AppState;

const DEFAULT_MAX_PARALLEL: usize = 2;
const MIN_MAX_PARALLEL: usize = 1;
const MAX_MAX_PARALLEL: usize = 16;
const DEFAULT_STEP_TIMEOUT_MS: u64 = 120_000;

#[derive(Debug, Clone, Deserialize)]
struct MeshStepSpec {
    id: String,
    prompt: String,
    #[serde(default, rename = "dependsOn")]
    depends_on: Vec<String>,
    #[serde(default, rename = "agentId")]
    #[allow(dead_code)]
    agent_id: Option<String>,
    #[serde(default, rename = "sessionKey")]
    session_key: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    thinking: Option<Value>,
    #[serde(default, rename = "timeoutMs")]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

struct StepRuntime {
    spec: MeshStepSpec,
    status: StepStatus,
    output: Option<String>,
    error: Option<String>,
}

/// One in-flight or finished mesh run. Step state lives behind a single
/// mutex — mesh step counts are small (tens, not thousands) so a
/// coarse-grained lock is simpler than per-step synchronization and never
/// shows up as a bottleneck.
pub struct MeshRun {
    pub id: String,
    steps: StdMutex<HashMap<String, StepRuntime>>,
    order: Vec<String>,
    max_parallel: usize,
    continue_on_error: bool,
    running: AtomicBool,
    notify: Arc<Notify>,
    cancel: CancellationToken,
}

fn clamp_max_parallel(v: Option<u64>) -> usize {
    v.map(|n| (n as usize).clamp(MIN_MAX_PARALLEL, MAX_MAX_PARALLEL))
        .unwrap_or(DEFAULT_MAX_PARALLEL)
}

/// Validate step id uniqueness, that every `dependsOn` entry refers to a
/// declared step, and that the graph is acyclic (Kahn's algorithm).
fn validate_graph(specs: &[MeshStepSpec]) -> Result<Vec<String>, String> {
    let mut seen = std::collections::HashSet::new();
    for s in specs {
        if !seen.insert(s.id.clone()) {
            return Err(format!("duplicate step id: {}", s.id));
        }
    }
    for s in specs {
        for dep in &s.depends_on {
            if !seen.contains(dep) {
                return Err(format!("step '{}' depends on unknown step '{dep}'", s.id));
            }
        }
    }

    let mut in_degree: HashMap<&str, usize> =
        specs.iter().map(|s| (s.id.as_str(), s.depends_on.len())).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for s in specs {
        for dep in &s.depends_on {
            dependents.entry(dep.as_str()).or_default().push(s.id.as_str());
        }
    }

    let mut ready: Vec<&str> =
        in_degree.iter().filter(|(_, &d)| d == 0).map(|(id, _)| *id).collect();
    let mut order = Vec::with_capacity(specs.len());
    while let Some(id) = ready.pop() {
        order.push(id.to_string());
        if let Some(deps) = dependents.get(id) {
            for &d in deps {
                let entry = in_degree.get_mut(d).unwrap();
                *entry -= 1;
                if *entry == 0 {
                    ready.push(d);
                }
            }
        }
    }
    if order.len() != specs.len() {
        return Err("mesh graph contains a cycle".to_string());
    }
    Ok(order)
}

pub async fn mesh_run(params: Option<&Value>, req_id: &str, app: &Arc<AppState>) -> ResFrame {
    let p = match params {
        Some(p) => p,
        None => return ResFrame::err(req_id, "INVALID_PARAMS", "params object required"),
    };
    let specs: Vec<MeshStepSpec> = match p.get("steps").cloned() {
        Some(v) => match serde_json::from_value(v) {
            Ok(s) => s,
            Err(e) => return ResFrame::err(req_id, "INVALID_PARAMS", &format!("bad steps: {e}")),
        },
        None => return ResFrame::err(req_id, "INVALID_PARAMS", "missing 'steps' field"),
    };
    if specs.is_empty() {
        return ResFrame::err(req_id, "INVALID_PARAMS", "'steps' must be non-empty");
    }

    let order = match validate_graph(&specs) {
        Ok(o) => o,
        Err(e) => return ResFrame::err(req_id, "CONFIG", &format!("invalid mesh graph: {e}")),
    };

    let max_parallel = clamp_max_parallel(p.get("maxParallel").and_then(|v| v.as_u64()));
    let continue_on_error = p.get("continueOnError").and_then(|v| v.as_bool()).unwrap_or(false);

    let mesh_id = uuid::Uuid::now_v7().to_string();
    let mut steps = HashMap::with_capacity(specs.len());
    for spec in specs {
        steps.insert(
            spec.id.clone(),
            StepRuntime { spec, status: StepStatus::Pending, output: None, error: None },
        );
    }

    let run = Arc::new(MeshRun {
        id: mesh_id.clone(),
        steps: StdMutex::new(steps),
        order,
        max_parallel,
        continue_on_error,
        running: AtomicBool::new(false),
        notify: Arc::new(Notify::new()),
        cancel: CancellationToken::new(),
    });
    app.mesh.insert(mesh_id.clone(), run.clone());

    spawn_driver(Arc::clone(app), run);

    ResFrame::ok(req_id, serde_json::json!({ "meshRunId": mesh_id, "status": "running" }))
}

fn spawn_driver(app: Arc<AppState>, run: Arc<MeshRun>) {
    if run.running.swap(true, Ordering::SeqCst) {
        return;
    }
    tokio::spawn(async move {
        drive(app, run.clone()).await;
        run.running.store(false, Ordering::SeqCst);
    });
}

/// Skip every `Pending` step transitively blocked by a `Failed`/`Skipped`
/// dependency, then return the steps now ready to launch plus the current
/// running/pending counts. Runs the skip pass to a fixpoint: skipping a step
/// can newly block its own dependents, so a single sweep only propagates one
/// generation deep — repeating until a sweep finds nothing new is what lets
/// grand-dependents of a failed step reach `Skipped` in the same call instead
/// of staying `Pending` until another driver tick happens to notice them.
fn advance(
    steps: &mut HashMap<String, StepRuntime>,
    order: &[String],
    continue_on_error: bool,
) -> (Vec<String>, usize, usize) {
    if !continue_on_error {
        loop {
            let mut skip_ids = Vec::new();
            for id in order {
                let blocked = {
                    let s = steps.get(id).unwrap();
                    if s.status != StepStatus::Pending {
                        continue;
                    }
                    s.spec.depends_on.iter().any(|dep| {
                        matches!(
                            steps.get(dep).map(|d| d.status),
                            Some(StepStatus::Failed) | Some(StepStatus::Skipped)
                        )
                    })
                };
                if blocked {
                    skip_ids.push(id.clone());
                }
            }
            if skip_ids.is_empty() {
                break;
            }
            for id in &skip_ids {
                steps.get_mut(id).unwrap().status = StepStatus::Skipped;
            }
        }
    }

    let ready: Vec<String> = order
        .iter()
        .filter(|id| {
            let s = steps.get(*id).unwrap();
            s.status == StepStatus::Pending
                && s.spec.depends_on.iter().all(|dep| {
                    matches!(
                        steps.get(dep).map(|d| d.status),
                        Some(StepStatus::Succeeded) | Some(StepStatus::Failed) | Some(StepStatus::Skipped)
                    ) && (continue_on_error || steps.get(dep).map(|d| d.status) == Some(StepStatus::Succeeded))
                })
        })
        .cloned()
        .collect();

    let running_count = steps.values().filter(|s| s.status == StepStatus::Running).count();
    let pending_count = steps.values().filter(|s| s.status == StepStatus::Pending).count();
    (ready, running_count, pending_count)
}

async fn drive(app: Arc<AppState>, run: Arc<MeshRun>) {
    loop {
        if run.cancel.is_cancelled() {
            return;
        }

        let (ready, running_count, pending_count) = {
            let mut steps = run.steps.lock().unwrap();
            advance(&mut steps, &run.order, run.continue_on_error)
        };

        if ready.is_empty() && running_count == 0 {
            return; // every step is terminal (or unreachable and now skipped)
        }

        let slots = run.max_parallel.saturating_sub(running_count);
        let to_launch: Vec<String> = ready.into_iter().take(slots).collect();

        if to_launch.is_empty() {
            if pending_count == 0 && running_count == 0 {
                return;
            }
            run.notify.notified().await;
            continue;
        }

        for step_id in to_launch {
            {
                let mut steps = run.steps.lock().unwrap();
                steps.get_mut(&step_id).unwrap().status = StepStatus::Running;
            }
            let app = Arc::clone(&app);
            let run = Arc::clone(&run);
            let mesh_id = run.id.clone();
            tokio::spawn(async move {
                let (prompt, session_key, timeout_ms) = {
                    let steps = run.steps.lock().unwrap();
                    let s = steps.get(&step_id).unwrap();
                    (
                        s.spec.prompt.clone(),
                        s.spec
                            .session_key
                            .clone()
                            .unwrap_or_else(|| format!("mesh:{mesh_id}:{step_id}")),
                        s.spec.timeout_ms.unwrap_or(DEFAULT_STEP_TIMEOUT_MS),
                    )
                };
                let run_id = format!("{mesh_id}:{step_id}");
                let outcome =
                    crate::chat::run::execute_run(&app, session_key.clone(), prompt, timeout_ms, run_id.clone())
                        .await;

                let mut steps = run.steps.lock().unwrap();
                let s = steps.get_mut(&step_id).unwrap();
                match outcome {
                    Ok(r) if r.meta.error.is_none() => {
                        s.status = StepStatus::Succeeded;
                        s.output = Some(
                            r.payloads.iter().map(|p| p.text.as_str()).collect::<Vec<_>>().join("\n"),
                        );
                        crate::chat::handlers::persist_run_result(&app, &session_key, &run_id, &r);
                    }
                    Ok(r) => {
                        s.status = StepStatus::Failed;
                        s.error = Some(format!("{:?}", r.meta.error.as_ref().unwrap().kind));
                    }
                    Err(e) => {
                        warn!(step_id, error = %e, "mesh step run failed");
                        s.status = StepStatus::Failed;
                        s.error = Some(e.to_string());
                    }
                }
                drop(steps);
                run.notify.notify_one();
            });
        }
    }
}

pub async fn mesh_status(params: Option<&Value>, req_id: &str, app: &Arc<AppState>) -> ResFrame {
    let mesh_id = match params.and_then(|p| p.get("meshRunId")).and_then(|v| v.as_str()) {
        Some(s) if !s.is_empty() => s,
        _ => return ResFrame::err(req_id, "INVALID_PARAMS", "missing 'meshRunId' field"),
    };
    let run = match app.mesh.get(mesh_id) {
        Some(r) => r.clone(),
        None => return ResFrame::err(req_id, "NOT_FOUND", &format!("mesh run not found: {mesh_id}")),
    };

    let steps = run.steps.lock().unwrap();
    let mut out = serde_json::Map::new();
    for id in &run.order {
        let s = steps.get(id).unwrap();
        out.insert(
            id.clone(),
            serde_json::json!({
                "status": s.status,
                "output": s.output,
                "error": s.error,
            }),
        );
    }
    let done = steps
        .values()
        .all(|s| !matches!(s.status, StepStatus::Pending | StepStatus::Running));
    drop(steps);

    ResFrame::ok(req_id, serde_json::json!({ "meshRunId": mesh_id, "steps": out, "done": done }))
}

pub async fn mesh_cancel(params: Option<&Value>, req_id: &str, app: &Arc<AppState>) -> ResFrame {
    let mesh_id = match params.and_then(|p| p.get("meshRunId")).and_then(|v| v.as_str()) {
        Some(s) if !s.is_empty() => s,
        _ => return ResFrame::err(req_id, "INVALID_PARAMS", "missing 'meshRunId' field"),
    };
    let run = match app.mesh.get(mesh_id) {
        Some(r) => r.clone(),
        None => return ResFrame::err(req_id, "NOT_FOUND", &format!("mesh run not found: {mesh_id}")),
    };
    let step_id = params.and_then(|p| p.get("stepId")).and_then(|v| v.as_str());

    match step_id {
        Some(id) => {
            let run_id = format!("{mesh_id}:{id}");
            if let Some(handle) = app.runs.get(&run_id) {
                handle.cancel.cancel();
            }
        }
        None => {
            run.cancel.cancel();
            for entry in app.runs.iter() {
                if entry.key().starts_with(&format!("{mesh_id}:")) {
                    entry.value().cancel.cancel();
                }
            }
        }
    }
    ResFrame::ok(req_id, serde_json::json!({ "ok": true }))
}

pub async fn mesh_retry(params: Option<&Value>, req_id: &str, app: &Arc<AppState>) -> ResFrame {
    let mesh_id = match params.and_then(|p| p.get("meshRunId")).and_then(|v| v.as_str()) {
        Some(s) if !s.is_empty() => s,
        _ => return ResFrame::err(req_id, "INVALID_PARAMS", "missing 'meshRunId' field"),
    };
    let run = match app.mesh.get(mesh_id) {
        Some(r) => r.clone(),
        None => return ResFrame::err(req_id, "NOT_FOUND", &format!("mesh run not found: {mesh_id}")),
    };
    let requested: Option<Vec<String>> = params
        .and_then(|p| p.get("stepIds"))
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect());

    {
        let mut steps = run.steps.lock().unwrap();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for (id, s) in steps.iter() {
            for dep in &s.spec.depends_on {
                dependents.entry(dep.clone()).or_default().push(id.clone());
            }
        }

        let seeds: Vec<String> = match requested {
            Some(ids) => ids,
            None => steps
                .iter()
                .filter(|(_, s)| matches!(s.status, StepStatus::Failed | StepStatus::Skipped))
                .map(|(id, _)| id.clone())
                .collect(),
        };

        let mut to_reset: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut stack = seeds;
        while let Some(id) = stack.pop() {
            if !to_reset.insert(id.clone()) {
                continue;
            }
            if let Some(children) = dependents.get(&id) {
                stack.extend(children.iter().cloned());
            }
        }
        for id in &to_reset {
            if let Some(s) = steps.get_mut(id) {
                s.status = StepStatus::Pending;
                s.output = None;
                s.error = None;
            }
        }
    }

    spawn_driver(Arc::clone(app), run);
    ResFrame::ok(req_id, serde_json::json!({ "ok": true }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, depends_on: &[&str]) -> StepRuntime {
        StepRuntime {
            spec: MeshStepSpec {
                id: id.to_string(),
                prompt: "do it".to_string(),
                depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
                agent_id: None,
                session_key: None,
                thinking: None,
                timeout_ms: None,
            },
            status: StepStatus::Pending,
            output: None,
            error: None,
        }
    }

    /// A chain `A -> B -> C` where A fails: one call to `advance` must skip
    /// both B and C (not just the direct dependent B), so the driver's
    /// `ready.is_empty() && running_count == 0` exit condition is correct on
    /// the very next tick instead of leaving C stuck `Pending` forever.
    #[test]
    fn skip_propagates_transitively_through_the_whole_chain() {
        let order = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let mut steps = HashMap::new();
        steps.insert("a".to_string(), step("a", &[]));
        steps.insert("b".to_string(), step("b", &["a"]));
        steps.insert("c".to_string(), step("c", &["b"]));
        steps.get_mut("a").unwrap().status = StepStatus::Failed;

        let (ready, running_count, pending_count) = advance(&mut steps, &order, false);

        assert!(ready.is_empty());
        assert_eq!(running_count, 0);
        assert_eq!(pending_count, 0);
        assert_eq!(steps.get("b").unwrap().status, StepStatus::Skipped);
        assert_eq!(steps.get("c").unwrap().status, StepStatus::Skipped);

        let done = steps
            .values()
            .all(|s| !matches!(s.status, StepStatus::Pending | StepStatus::Running));
        assert!(done, "mesh_status.done must be true once the chain is fully resolved");
    }

    #[test]
    fn continue_on_error_runs_dependents_of_a_failed_step_instead_of_skipping() {
        let order = vec!["a".to_string(), "b".to_string()];
        let mut steps = HashMap::new();
        steps.insert("a".to_string(), step("a", &[]));
        steps.insert("b".to_string(), step("b", &["a"]));
        steps.get_mut("a").unwrap().status = StepStatus::Failed;

        let (ready, _, _) = advance(&mut steps, &order, true);

        assert_eq!(ready, vec!["b".to_string()]);
        assert_eq!(steps.get("b").unwrap().status, StepStatus::Pending);
    }
}
