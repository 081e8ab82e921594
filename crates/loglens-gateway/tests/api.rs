use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use loglens_agent::{Collaborators, ForensicTeam};
use loglens_core::config::{ApiKeyConfig, ApiKeyRole, GatewayConfig};
use loglens_core::event::EventBus;
use loglens_core::traits::ObjectStore;
use loglens_core::types::LogType;
use loglens_gateway::GatewayServer;
use loglens_store::{FsObjectStore, SqliteStore, StagedLogSource};
use loglens_test_utils::*;

struct TestGateway {
    base: String,
    http: reqwest::Client,
    shutdown: CancellationToken,
    _dir: TempDir,
}

impl TestGateway {
    async fn start(gateway: GatewayConfig, reasoner: ScriptedReasoner) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let objects: Arc<dyn ObjectStore> =
            Arc::new(FsObjectStore::new(dir.path().join("objects")));
        let staged = Arc::new(StagedLogSource::new(objects.clone()));
        let collaborators = Collaborators::new(Arc::new(reasoner), objects)
            .with_log_source(staged.clone())
            .with_index(store.clone());
        let team = ForensicTeam::assemble(&config, collaborators, Arc::new(EventBus::default()))
            .unwrap();

        let server = GatewayServer::new(gateway, Arc::new(team), store, staged);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move { server.serve(listener, token).await });

        Self {
            base: format!("http://{}", addr),
            http: reqwest::Client::new(),
            shutdown,
            _dir: dir,
        }
    }

    async fn open(reasoner: ScriptedReasoner) -> Self {
        Self::start(GatewayConfig::default(), reasoner).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn post(&self, path: &str, bearer: Option<&str>, body: Value) -> (u16, Value) {
        let mut req = self.http.post(self.url(path)).json(&body);
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn get(&self, path: &str, bearer: Option<&str>) -> (u16, Value) {
        let mut req = self.http.get(self.url(path));
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn computer(&self, bearer: Option<&str>, name: &str) -> i64 {
        let (status, body) = self
            .post("/api/computers", bearer, json!({ "name": name }))
            .await;
        assert_eq!(status, 201);
        body["id"].as_i64().unwrap()
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn keyed_gateway() -> GatewayConfig {
    GatewayConfig {
        api_keys: vec![
            ApiKeyConfig {
                name: "dashboard".to_string(),
                key: "lk_view".to_string(),
                role: ApiKeyRole::Viewer,
            },
            ApiKeyConfig {
                name: "collector".to_string(),
                key: "lk_ops".to_string(),
                role: ApiKeyRole::Operator,
            },
        ],
        ..GatewayConfig::default()
    }
}

#[tokio::test]
async fn test_health_needs_no_auth() {
    let gw = TestGateway::start(keyed_gateway(), ScriptedReasoner::forensic()).await;
    let (status, body) = gw.get("/api/health", None).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_roles_are_enforced() {
    let gw = TestGateway::start(keyed_gateway(), ScriptedReasoner::forensic()).await;

    assert_eq!(gw.get("/api/computers", None).await.0, 401);
    assert_eq!(gw.get("/api/computers", Some("lk_nope")).await.0, 401);
    assert_eq!(gw.get("/api/computers", Some("lk_view")).await.0, 200);

    let (status, _) = gw
        .post("/api/computers", Some("lk_view"), json!({ "name": "WS-01" }))
        .await;
    assert_eq!(status, 403);
    gw.computer(Some("lk_ops"), "WS-01").await;

    let (_, listing) = gw.get("/api/computers", Some("lk_view")).await;
    assert_eq!(listing["computers"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_signup_signin_and_ownership() {
    let gw = TestGateway::start(keyed_gateway(), ScriptedReasoner::forensic()).await;

    let signup = json!({ "email": "ana@example.com", "password": "hunter22", "organization": "SOC" });
    let (status, user) = gw.post("/api/users/signup", None, signup.clone()).await;
    assert_eq!(status, 201);
    assert_eq!(user["organization"], "SOC");
    assert!(user.get("password").is_none());
    assert_eq!(gw.post("/api/users/signup", None, signup).await.0, 409);

    let (status, _) = gw
        .post(
            "/api/users/signin",
            None,
            json!({ "email": "ana@example.com", "password": "wrong" }),
        )
        .await;
    assert_eq!(status, 401);

    let (status, session) = gw
        .post(
            "/api/users/signin",
            None,
            json!({ "email": "ana@example.com", "password": "hunter22" }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(session["token_type"], "bearer");
    let token = session["access_token"].as_str().unwrap().to_string();

    let mine = gw.computer(Some(&token), "ANA-LAPTOP").await;
    let shared = gw.computer(Some("lk_ops"), "DC-01").await;

    let (_, listing) = gw.get("/api/computers", Some(&token)).await;
    let names: Vec<&str> = listing["computers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["ANA-LAPTOP"]);

    assert_eq!(gw.get(&format!("/api/computers/{}", mine), Some(&token)).await.0, 200);
    assert_eq!(gw.get(&format!("/api/computers/{}", shared), Some(&token)).await.0, 404);
    // Key holders see every computer.
    assert_eq!(gw.get(&format!("/api/computers/{}", mine), Some("lk_view")).await.0, 200);
}

#[tokio::test]
async fn test_inline_task_is_analyzed_and_stored() {
    let gw = TestGateway::open(ScriptedReasoner::forensic()).await;
    let computer = gw.computer(None, "WS-07").await;

    let (status, body) = gw
        .post(
            "/api/tasks",
            None,
            json!({
                "computer_id": computer,
                "task_type": "Prefetch",
                "logs": prefetch_records(),
            }),
        )
        .await;
    assert_eq!(status, 201);
    let task = &body["task"];
    assert_eq!(task["task_type"], "prefetch");
    assert_eq!(task["analysis_result"], ANALYSIS_TEXT);
    let charts = task["charts"].as_array().unwrap();
    assert_eq!(charts.len(), 1);
    assert!(charts[0].as_str().unwrap().ends_with("chart1.svg"));
    assert!(body["job_id"].is_string());

    let (_, listing) = gw
        .get(&format!("/api/computers/{}/tasks", computer), None)
        .await;
    assert_eq!(listing["tasks"].as_array().unwrap().len(), 1);

    let (status, found) = gw.get("/api/search?q=Control", None).await;
    assert_eq!(status, 200);
    assert_eq!(found["hits"][0]["task_id"], task["id"]);
}

#[tokio::test]
async fn test_task_for_unknown_computer_is_not_found() {
    let gw = TestGateway::open(ScriptedReasoner::forensic()).await;
    let (status, _) = gw
        .post(
            "/api/tasks",
            None,
            json!({ "computer_id": 99, "task_type": "system", "logs": [] }),
        )
        .await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_task_rejects_bad_input() {
    let gw = TestGateway::open(ScriptedReasoner::forensic()).await;
    let computer = gw.computer(None, "WS-07").await;

    let unknown_type = json!({ "computer_id": computer, "task_type": "registry", "logs": [] });
    assert_eq!(gw.post("/api/tasks", None, unknown_type).await.0, 400);

    // Neither inline logs nor a time range.
    let no_source = json!({ "computer_id": computer, "task_type": "system" });
    assert_eq!(gw.post("/api/tasks", None, no_source).await.0, 400);
}

#[tokio::test]
async fn test_staged_logs_feed_a_task() {
    let gw = TestGateway::open(ScriptedReasoner::forensic()).await;
    let computer = gw.computer(None, "WS-07").await;
    let mut sel = selector(LogType::System);
    sel.computer_id = computer;

    assert_eq!(gw.post("/api/logs/query", None, json!(sel)).await.0, 404);

    let (status, staged) = gw
        .post(
            "/api/logs",
            None,
            json!({ "selector": sel, "records": system_event_records() }),
        )
        .await;
    assert_eq!(status, 201);
    assert_eq!(staged["records"], 3);
    assert_eq!(staged["key"], sel.staged_key());

    let (status, fetched) = gw.post("/api/logs/query", None, json!(sel)).await;
    assert_eq!(status, 200);
    assert_eq!(fetched["records"].as_array().unwrap().len(), 3);

    let (status, body) = gw
        .post(
            "/api/tasks",
            None,
            json!({
                "computer_id": computer,
                "task_type": "system",
                "start": sel.start,
                "end": sel.end,
                "user_id": sel.user_id,
            }),
        )
        .await;
    assert_eq!(status, 201);
    assert_eq!(body["task"]["task_type"], "system");
}

#[tokio::test]
async fn test_failed_job_persists_nothing() {
    let reasoner = ScriptedReasoner::new().when(prompts::ANALYSIS, "Still looking.");
    let gw = TestGateway::open(reasoner).await;
    let computer = gw.computer(None, "WS-07").await;

    let (status, body) = gw
        .post(
            "/api/tasks",
            None,
            json!({
                "computer_id": computer,
                "task_type": "application",
                "logs": system_event_records(),
            }),
        )
        .await;
    assert_eq!(status, 502);
    assert_eq!(body["status"], "failed");
    assert_eq!(body["reason"], "step_budget_exhausted");

    let (_, listing) = gw
        .get(&format!("/api/computers/{}/tasks", computer), None)
        .await;
    assert!(listing["tasks"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_task_update_and_delete() {
    let gw = TestGateway::open(ScriptedReasoner::forensic()).await;
    let computer = gw.computer(None, "WS-07").await;
    let (_, body) = gw
        .post(
            "/api/tasks",
            None,
            json!({ "computer_id": computer, "task_type": "system", "logs": system_event_records() }),
        )
        .await;
    let id = body["task"]["id"].as_i64().unwrap();
    let path = format!("/api/tasks/{}", id);

    let resp = gw
        .http
        .put(gw.url(&path))
        .json(&json!({ "analysis_result": "Reviewed: benign." }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let (_, task) = gw.get(&path, None).await;
    assert_eq!(task["analysis_result"], "Reviewed: benign.");
    assert_eq!(task["charts"].as_array().unwrap().len(), 1);

    let resp = gw.http.delete(gw.url(&path)).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 204);
    assert_eq!(gw.get(&path, None).await.0, 404);
}

#[tokio::test]
async fn test_graph_description() {
    let gw = TestGateway::open(ScriptedReasoner::forensic()).await;
    let (status, graph) = gw.get("/api/graph", None).await;
    assert_eq!(status, 200);
    assert_eq!(graph["entry"], "team_supervisor");
    let nodes: Vec<&str> = graph["nodes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["name"].as_str().unwrap())
        .collect();
    assert!(nodes.contains(&"data_search_agent"));
    assert!(nodes.contains(&"data_visualization_agent"));
}
