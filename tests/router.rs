use async_trait::async_trait;
use chain_bridge::collect::{ChainSource, JobStatus};
use chain_bridge::config::{BridgeConfig, CollectionConfig};
use chain_bridge::dom::ExpirationRef;
use chain_bridge::error::{BridgeError, Result};
use chain_bridge::model::{Greeks, Quote, ScrapedOption, Side};
use chain_bridge::router::{Background, CollectionEvent, TabCommands, TabHost, TabId, TabInfo};
use chain_bridge::scrape::ParsedPage;
use chain_bridge::store::{MemoryStore, NewPosition, PositionStore, load_full_chain};
use chain_bridge::sync::page::{CALCULATOR_STATE_KEY, COMMAND_KEY};
use chain_bridge::sync::{CalculatorState, MemoryPageStorage, PageStorage, SyncBridge};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

const CALCULATOR_URL: &str = "https://futures.optioner.online/tools/universal-calculator";

struct FakeChain {
    current: Mutex<String>,
    broken_parse: Vec<&'static str>,
    gated: bool,
    gate: Semaphore,
    ready_gated: bool,
    ready_gate: Semaphore,
    never_ready: bool,
}

impl FakeChain {
    fn new() -> Self {
        Self {
            current: Mutex::new("20260116".to_string()),
            broken_parse: Vec::new(),
            gated: false,
            gate: Semaphore::new(0),
            ready_gated: false,
            ready_gate: Semaphore::new(0),
            never_ready: false,
        }
    }

    /// The page becomes ready only once a permit is released
    fn slow_to_render() -> Self {
        Self {
            ready_gated: true,
            ..Self::new()
        }
    }

    fn never_renders() -> Self {
        Self {
            never_ready: true,
            ..Self::new()
        }
    }

    /// Each expiration load waits for a permit
    fn gated() -> Self {
        Self {
            gated: true,
            ..Self::new()
        }
    }

    fn release(&self, loads: usize) {
        self.gate.add_permits(loads);
    }
}

#[async_trait]
impl ChainSource for FakeChain {
    async fn parse_current(&self) -> Result<ParsedPage> {
        let code = self.current.lock().unwrap().clone();
        if self.broken_parse.contains(&code.as_str()) {
            return Err(BridgeError::TableNotFound(code));
        }
        Ok(ParsedPage {
            ticker: Some("ESH2026".to_string()),
            expiration: code.clone(),
            date_code: Some(code),
            underlying_price: Some(6910.75),
            options: [Side::Call, Side::Put, Side::Call, Side::Put]
                .into_iter()
                .enumerate()
                .map(|(i, side)| ScrapedOption {
                    side,
                    strike: 6900.0 + (i / 2) as f64 * 5.0,
                    quote: Quote {
                        bid: 10.0 + i as f64,
                        ask: 10.5 + i as f64,
                        price: 10.25 + i as f64,
                        volume: 100 * (i as u64 + 1),
                        iv: 0.2,
                    },
                    greeks: Greeks::default(),
                })
                .collect(),
        })
    }

    async fn expirations(&self) -> Result<Vec<ExpirationRef>> {
        Ok(["20260116", "20260123", "20260130", "20260206"]
            .iter()
            .map(|code| ExpirationRef {
                date_code: code.to_string(),
                display_date: code.to_string(),
            })
            .collect())
    }

    async fn open_expiration(&self, expiration: &ExpirationRef, _timeout: Duration) -> Result<()> {
        if self.gated {
            self.gate
                .acquire()
                .await
                .map_err(|e| BridgeError::NavigationFailed(e.to_string()))?
                .forget();
        }
        *self.current.lock().unwrap() = expiration.date_code.clone();
        Ok(())
    }

    async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        if self.never_ready {
            return Err(BridgeError::TableNotFound(format!("not rendered after {:?}", timeout)));
        }
        if self.ready_gated {
            self.ready_gate
                .acquire()
                .await
                .map_err(|e| BridgeError::TableNotFound(e.to_string()))?
                .forget();
        }
        Ok(())
    }
}

struct FakeHost {
    chain: Arc<FakeChain>,
    tabs: Mutex<Vec<TabInfo>>,
    pages: Mutex<HashMap<TabId, Arc<MemoryPageStorage>>>,
    opened: Mutex<Vec<(String, bool)>>,
    closed: Mutex<Vec<TabId>>,
    sent: Mutex<Vec<(TabId, Value)>>,
    reloads: AtomicUsize,
}

impl FakeHost {
    fn new(chain: FakeChain) -> Self {
        Self {
            chain: Arc::new(chain),
            tabs: Mutex::new(Vec::new()),
            pages: Mutex::new(HashMap::new()),
            opened: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            reloads: AtomicUsize::new(0),
        }
    }

    fn with_tab(self, id: &str, url: &str) -> Self {
        self.tabs.lock().unwrap().push(TabInfo {
            id: TabId::from(id),
            url: url.to_string(),
        });
        self
    }

    /// The user closes a tab
    fn drop_tab(&self, id: &str) {
        self.tabs.lock().unwrap().retain(|tab| tab.id.as_str() != id);
    }

    fn closed(&self) -> Vec<TabId> {
        self.closed.lock().unwrap().clone()
    }

    fn page(&self, id: &TabId) -> Arc<MemoryPageStorage> {
        self.pages
            .lock()
            .unwrap()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(MemoryPageStorage::new()))
            .clone()
    }

    fn sent_to(&self, id: &str) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(tab, _)| tab.as_str() == id)
            .map(|(_, message)| message.clone())
            .collect()
    }

    fn exists(&self, id: &TabId) -> Result<()> {
        if self.tabs.lock().unwrap().iter().any(|tab| &tab.id == id) {
            Ok(())
        } else {
            Err(BridgeError::ChannelClosed(format!("no tab {}", id)))
        }
    }
}

#[async_trait]
impl TabHost for FakeHost {
    async fn open_tab(&self, url: &str, active: bool) -> Result<TabId> {
        let mut opened = self.opened.lock().unwrap();
        let id = TabId::from(format!("{}", 100 + opened.len()));
        opened.push((url.to_string(), active));
        self.tabs.lock().unwrap().push(TabInfo {
            id: id.clone(),
            url: url.to_string(),
        });
        Ok(id)
    }

    async fn list_tabs(&self) -> Result<Vec<TabInfo>> {
        Ok(self.tabs.lock().unwrap().clone())
    }

    async fn focus_tab(&self, tab: &TabId) -> Result<()> {
        self.exists(tab)
    }

    async fn close_tab(&self, tab: &TabId) -> Result<()> {
        self.exists(tab)?;
        self.tabs.lock().unwrap().retain(|info| &info.id != tab);
        self.closed.lock().unwrap().push(tab.clone());
        Ok(())
    }

    async fn navigate(&self, tab: &TabId, url: &str) -> Result<()> {
        self.exists(tab)?;
        for info in self.tabs.lock().unwrap().iter_mut().filter(|info| &info.id == tab) {
            info.url = url.to_string();
        }
        Ok(())
    }

    async fn reload(&self, tab: &TabId) -> Result<()> {
        self.exists(tab)?;
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, tab: &TabId, message: Value) -> Result<Value> {
        self.exists(tab)?;
        self.sent.lock().unwrap().push((tab.clone(), message));
        Ok(json!({ "success": true }))
    }

    async fn page_storage(&self, tab: &TabId) -> Result<Arc<dyn PageStorage>> {
        self.exists(tab)?;
        Ok(self.page(tab))
    }

    async fn chain_source(&self, tab: &TabId) -> Result<Arc<dyn ChainSource>> {
        self.exists(tab)?;
        Ok(self.chain.clone())
    }
}

fn background(host: Arc<FakeHost>, durable: Arc<MemoryStore>, collection: CollectionConfig) -> Arc<Background> {
    Background::new(BridgeConfig::default().collection(collection), host, durable)
}

fn start(tab: &str) -> Value {
    json!({ "action": "startCollection", "payload": { "tabId": tab } })
}

async fn stored_position() -> (Arc<MemoryStore>, Value) {
    let durable = Arc::new(MemoryStore::new());
    let mut positions = PositionStore::new(durable.clone());
    positions
        .add(
            "ESH2026",
            NewPosition {
                side: Side::Put,
                strike: 6900.0,
                expiration_label: "2026-01-16".to_string(),
                quote: Quote {
                    bid: 20.0,
                    ask: 21.0,
                    price: 20.5,
                    volume: 150,
                    iv: 0.21,
                },
                greeks: Greeks::default(),
            },
        )
        .await;
    let records = serde_json::to_value(positions.get("ESH2026")).unwrap();
    (durable, records)
}

#[tokio::test]
async fn test_second_start_while_running_is_rejected() {
    let host = Arc::new(FakeHost::new(FakeChain::gated()).with_tab("7", "https://www.tradingview.com/options/chain/"));
    let durable = Arc::new(MemoryStore::new());
    let background = background(host.clone(), durable.clone(), CollectionConfig::immediate());

    let first = background.handle(start("7"), None).await;
    assert!(first.success);
    assert_eq!(background.job().status, JobStatus::Running);

    let second = background.handle(start("8"), None).await;
    assert!(!second.success);
    assert_eq!(second.error.as_deref(), Some("Collection already running"));
    assert_eq!(background.job().tab_id, Some(TabId::from("7")));

    host.chain.release(10);
    let outcome = background.wait_for_collection().await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.collected_count, 16);
    assert_eq!(outcome.expirations_collected, 4);
    assert!(outcome.error.is_none());

    let snapshot = load_full_chain(durable.as_ref()).await.unwrap().unwrap();
    assert_eq!(snapshot.option_count(), 16);
    assert_eq!(snapshot.underlying_price, 6910.75);
}

#[tokio::test]
async fn test_failed_expiration_is_noted_and_skipped() {
    let chain = FakeChain {
        broken_parse: vec!["20260123"],
        ..FakeChain::new()
    };
    let host = Arc::new(FakeHost::new(chain).with_tab("7", "https://www.tradingview.com/options/chain/"));
    let background = background(host, Arc::new(MemoryStore::new()), CollectionConfig::immediate());

    assert!(background.handle(start("7"), None).await.success);
    let outcome = background.wait_for_collection().await.unwrap();

    assert_eq!(outcome.status, JobStatus::Done);
    assert_eq!(outcome.collected_count, 12);
    assert!(outcome.error.as_deref().unwrap().contains("20260123"));

    let job = background.job();
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.collected_count, 12);
    assert!(job.error_message.is_some());
}

#[tokio::test]
async fn test_status_is_acknowledged_once() {
    let host = Arc::new(FakeHost::new(FakeChain::new()).with_tab("7", "https://www.tradingview.com/options/chain/"));
    let background = background(host, Arc::new(MemoryStore::new()), CollectionConfig::immediate());

    assert!(background.handle(start("7"), None).await.success);
    background.wait_for_collection().await.unwrap();

    let status = background.handle(json!({ "action": "getCollectionStatus" }), None).await;
    assert_eq!(status.data.as_ref().unwrap()["status"], "done");
    assert_eq!(status.data.as_ref().unwrap()["collectedCount"], 16);

    let status = background.handle(json!({ "action": "collectionStatus" }), None).await;
    assert_eq!(status.data.unwrap()["status"], "idle");
}

#[tokio::test]
async fn test_cooldown_blocks_immediate_restart() {
    let host = Arc::new(FakeHost::new(FakeChain::new()).with_tab("7", "https://www.tradingview.com/options/chain/"));
    let collection = CollectionConfig::immediate().cooldown(Duration::from_secs(30));
    let background = background(host, Arc::new(MemoryStore::new()), collection);

    assert!(background.handle(start("7"), None).await.success);
    background.wait_for_collection().await.unwrap();

    let again = background.handle(start("7"), None).await;
    assert!(!again.success);
    assert!(again.error.unwrap().starts_with("Wait"));
}

#[tokio::test]
async fn test_stop_cancels_without_saving() {
    let host = Arc::new(FakeHost::new(FakeChain::gated()).with_tab("7", "https://www.tradingview.com/options/chain/"));
    let durable = Arc::new(MemoryStore::new());
    let background = background(host.clone(), durable.clone(), CollectionConfig::immediate());

    assert!(background.handle(start("7"), None).await.success);
    let stop = background.handle(json!({ "action": "stopCollection" }), None).await;
    assert_eq!(stop.data.unwrap()["stopping"], true);

    host.chain.release(10);
    let outcome = background.wait_for_collection().await.unwrap();
    assert_eq!(outcome.status, JobStatus::Error);
    assert_eq!(outcome.error.as_deref(), Some("cancelled"));
    assert!(load_full_chain(durable.as_ref()).await.unwrap().is_none());

    let stop = background.handle(json!({ "action": "stopCollection" }), None).await;
    assert_eq!(stop.data.unwrap()["stopping"], false);
}

#[tokio::test]
async fn test_progress_reaches_sender_tab_and_subscribers() {
    let host = Arc::new(
        FakeHost::new(FakeChain::new())
            .with_tab("7", "https://www.tradingview.com/options/chain/")
            .with_tab("calc", CALCULATOR_URL),
    );
    let background = background(host.clone(), Arc::new(MemoryStore::new()), CollectionConfig::immediate());
    let mut events = background.subscribe();

    assert!(background.handle(start("7"), Some(TabId::from("calc"))).await.success);
    background.wait_for_collection().await.unwrap();

    let statuses = host.sent_to("calc");
    assert_eq!(statuses.len(), 5);
    assert!(statuses.iter().all(|m| m["action"] == "updateTVCStatus"));
    assert_eq!(statuses[0]["status"]["status"], "running");
    assert_eq!(statuses[4]["status"]["status"], "done");
    assert_eq!(statuses[4]["status"]["collected"], 16);

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    assert_eq!(received.len(), 5);
    assert_eq!(
        received.last(),
        Some(&CollectionEvent::Complete {
            success: true,
            options_count: Some(16),
            error: None,
        })
    );
}

#[tokio::test]
async fn test_closed_status_tab_does_not_fail_collection() {
    let host = Arc::new(
        FakeHost::new(FakeChain::new())
            .with_tab("7", "https://www.tradingview.com/options/chain/")
            .with_tab("calc", CALCULATOR_URL),
    );
    let background = background(host.clone(), Arc::new(MemoryStore::new()), CollectionConfig::immediate());

    host.drop_tab("calc");
    assert!(background.handle(start("7"), Some(TabId::from("calc"))).await.success);
    assert!(background.wait_for_collection().await.unwrap().is_success());
}

#[tokio::test]
async fn test_start_on_missing_tab_fails_cleanly() {
    let host = Arc::new(FakeHost::new(FakeChain::new()));
    let background = background(host, Arc::new(MemoryStore::new()), CollectionConfig::immediate());

    let response = background.handle(start("99"), None).await;
    assert!(!response.success);
    assert_eq!(background.job().status, JobStatus::Error);
    assert!(background.job().error_message.unwrap().starts_with("cannot start"));
}

#[tokio::test]
async fn test_missing_tab_failure_is_published() {
    let host = Arc::new(FakeHost::new(FakeChain::new()));
    let background = background(host, Arc::new(MemoryStore::new()), CollectionConfig::immediate());
    let mut events = background.subscribe();

    assert!(!background.handle(start("99"), None).await.success);
    match events.try_recv() {
        Ok(CollectionEvent::Complete {
            success,
            options_count,
            error,
        }) => {
            assert!(!success);
            assert_eq!(options_count, None);
            assert!(error.unwrap().starts_with("cannot start"));
        }
        other => panic!("Expected a failed completion, got {:?}", other),
    }
}

#[tokio::test]
async fn test_open_destination_tab_writes_calculator_state() {
    let (durable, records) = stored_position().await;
    let host = Arc::new(FakeHost::new(FakeChain::new()));
    let background = background(host.clone(), durable, CollectionConfig::immediate());

    let response = background
        .handle(
            json!({
                "action": "openOptionerTab",
                "payload": { "ticker": "ESH2026", "positions": records, "underlyingPrice": 6905.25 }
            }),
            None,
        )
        .await;
    assert!(response.success, "{:?}", response.error);

    let data = response.data.unwrap();
    assert_eq!(data["reused"], false);
    assert_eq!(data["url"], format!("{}?contract=ESH26", CALCULATOR_URL));
    assert_eq!(host.opened.lock().unwrap().as_slice(), &[(format!("{}?contract=ESH26", CALCULATOR_URL), true)]);
    assert_eq!(host.reloads.load(Ordering::SeqCst), 1);

    let tab = TabId::from(data["tabId"].as_str().unwrap());
    let raw = host.page(&tab).peek(CALCULATOR_STATE_KEY).unwrap();
    let state: CalculatorState = serde_json::from_str(&raw).unwrap();
    assert_eq!(state.selected_ticker.as_deref(), Some("CME_MINI:ESH2026"));
    assert_eq!(state.underlying_price, Some(6905.25));
    assert_eq!(state.options.len(), 1);
    assert_eq!(state.options[0].side, Side::Put);
    assert_eq!(state.options[0].date, "2026-01-16");
}

#[tokio::test]
async fn test_open_destination_tab_always_opens_new_by_default() {
    let host = Arc::new(FakeHost::new(FakeChain::new()).with_tab("1", CALCULATOR_URL));
    let background = background(host.clone(), Arc::new(MemoryStore::new()), CollectionConfig::immediate());

    let message = json!({ "action": "openDestinationTab", "payload": { "ticker": "ESH2026" } });
    assert!(background.handle(message, None).await.success);
    assert_eq!(host.opened.lock().unwrap().len(), 1);
    assert_eq!(host.list_tabs().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_open_destination_tab_reuses_when_configured() {
    let host = Arc::new(FakeHost::new(FakeChain::new()).with_tab("1", CALCULATOR_URL));
    let mut config = BridgeConfig::default();
    config.destination.reuse_existing_tab = true;
    let background = Background::new(config, host.clone(), Arc::new(MemoryStore::new()));

    let message = json!({ "action": "openDestinationTab", "payload": { "ticker": "NQH2026" } });
    let response = background.handle(message, None).await;
    assert_eq!(response.data.unwrap()["reused"], true);
    assert!(host.opened.lock().unwrap().is_empty());
    assert_eq!(
        host.list_tabs().await.unwrap()[0].url,
        format!("{}?contract=NQH26", CALCULATOR_URL)
    );
}

#[tokio::test]
async fn test_relay_to_closed_tab_reports_failure() {
    let host = Arc::new(FakeHost::new(FakeChain::new()).with_tab("5", CALCULATOR_URL));
    let background = background(host.clone(), Arc::new(MemoryStore::new()), CollectionConfig::immediate());

    let relay = |tab: &str| json!({ "action": "relay", "payload": { "tabId": tab, "action": "refresh" } });
    assert!(background.handle(relay("5"), None).await.success);
    assert_eq!(host.sent_to("5"), vec![json!({ "action": "refresh" })]);

    host.drop_tab("5");
    let response = background.handle(relay("5"), None).await;
    assert!(!response.success);
    assert!(response.error.unwrap().contains("unreachable"));
}

#[tokio::test]
async fn test_unknown_and_malformed_messages() {
    let host = Arc::new(FakeHost::new(FakeChain::new()));
    let background = background(host, Arc::new(MemoryStore::new()), CollectionConfig::immediate());

    let response = background.handle(json!({ "action": "selfDestruct" }), None).await;
    assert!(!response.success);
    assert_eq!(response.error.as_deref(), Some("unknown action"));

    let response = background.handle(json!({ "action": "startCollection" }), None).await;
    assert!(!response.success);
    assert!(response.error.unwrap().contains("startCollection"));

    let response = background.handle(json!("startCollection"), None).await;
    assert!(!response.success);
}

#[tokio::test]
async fn test_get_positions_accepts_legacy_shape() {
    let (durable, _) = stored_position().await;
    let background = background(Arc::new(FakeHost::new(FakeChain::new())), durable, CollectionConfig::immediate());

    let response = background
        .handle(json!({ "type": "GET_POSITIONS", "ticker": "CME_MINI:ESH2026" }), None)
        .await;
    let records = response.data.unwrap();
    assert_eq!(records.as_array().unwrap().len(), 1);
    assert_eq!(records[0]["side"], "PUT");

    let response = background.handle(json!({ "action": "getPositions" }), None).await;
    assert!(response.data.unwrap().get("ESH2026").is_some());
}

#[tokio::test]
async fn test_collect_full_chain_opens_background_tab() {
    let host = Arc::new(FakeHost::new(FakeChain::new()).with_tab("calc", CALCULATOR_URL));
    let background = background(host.clone(), Arc::new(MemoryStore::new()), CollectionConfig::immediate());

    let response = background
        .handle(
            json!({ "action": "collectFullChain", "payload": { "ticker": "ESH2026", "maxExpirations": 1 } }),
            Some(TabId::from("calc")),
        )
        .await;
    assert!(response.success, "{:?}", response.error);

    let opened = host.opened.lock().unwrap().clone();
    assert_eq!(opened.len(), 1);
    assert!(opened[0].0.contains("ESH2026"));
    assert!(!opened[0].1);

    let outcome = background.wait_for_collection().await.unwrap();
    assert_eq!(outcome.expirations_collected, 2);
    assert_eq!(host.sent_to("calc").last().unwrap()["status"]["status"], "done");
}

#[tokio::test]
async fn test_page_command_routed_with_sender_tab() {
    let host = Arc::new(
        FakeHost::new(FakeChain::new())
            .with_tab("7", "https://www.tradingview.com/options/chain/")
            .with_tab("calc", CALCULATOR_URL),
    );
    let background = background(host.clone(), Arc::new(MemoryStore::new()), CollectionConfig::immediate());

    let page = Arc::new(MemoryPageStorage::new());
    page.put_external(COMMAND_KEY, start("7").to_string());
    let mut bridge = SyncBridge::new(page.clone(), Arc::new(MemoryStore::new()))
        .with_commands(Arc::new(TabCommands::new(background.clone(), TabId::from("calc"))));

    let report = bridge.tick().await.unwrap();
    assert_eq!(report.command_replies.len(), 1);
    assert_eq!(report.command_replies[0]["success"], true);
    assert!(page.peek(COMMAND_KEY).is_none());

    background.wait_for_collection().await.unwrap();
    assert!(!host.sent_to("calc").is_empty());
}

fn collect_full_chain() -> Value {
    json!({ "action": "collectFullChain", "payload": { "ticker": "ESH2026", "maxExpirations": 1 } })
}

#[tokio::test]
async fn test_concurrent_full_chain_requests_open_one_tab() {
    let host = Arc::new(FakeHost::new(FakeChain::slow_to_render()).with_tab("calc", CALCULATOR_URL));
    let background = background(host.clone(), Arc::new(MemoryStore::new()), CollectionConfig::immediate());

    let (first, second, _) = tokio::join!(
        background.handle(collect_full_chain(), Some(TabId::from("calc"))),
        background.handle(collect_full_chain(), Some(TabId::from("calc"))),
        async { host.chain.ready_gate.add_permits(1) },
    );

    assert!(first.success != second.success);
    let rejected = if first.success { second } else { first };
    assert_eq!(rejected.error.as_deref(), Some("Collection already running"));
    assert_eq!(host.opened.lock().unwrap().len(), 1);

    let outcome = background.wait_for_collection().await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(background.job().tab_id, Some(TabId::from("100")));
}

#[tokio::test]
async fn test_full_chain_tab_closed_when_never_ready() {
    let host = Arc::new(FakeHost::new(FakeChain::never_renders()).with_tab("calc", CALCULATOR_URL));
    let background = background(host.clone(), Arc::new(MemoryStore::new()), CollectionConfig::immediate());
    let mut events = background.subscribe();

    let response = background.handle(collect_full_chain(), Some(TabId::from("calc"))).await;
    assert!(!response.success);

    assert_eq!(host.closed(), vec![TabId::from("100")]);
    assert_eq!(host.list_tabs().await.unwrap().len(), 1);
    assert_eq!(background.job().status, JobStatus::Error);
    assert!(background.job().error_message.unwrap().starts_with("cannot start"));
    assert_eq!(host.sent_to("calc").last().unwrap()["status"]["status"], "error");

    match events.try_recv() {
        Ok(CollectionEvent::Complete { success, .. }) => assert!(!success),
        other => panic!("Expected a failed completion, got {:?}", other),
    }

    // The failure leaves the job free for the next request
    let status = background.handle(json!({ "action": "collectionStatus" }), None).await;
    assert_eq!(status.data.unwrap()["status"], "error");
    assert_eq!(background.job().status, JobStatus::Idle);
}

fn open_pinned(records: &Value) -> Value {
    json!({
        "action": "openPinnedTab",
        "payload": {
            "url": "https://www.tradingview.com/options/chain/?symbol=CME_MINI:ESH2026&series=20260123",
            "expiration": "Jan 23",
            "ticker": "CME_MINI:ESH2026",
            "strike": 6900,
            "type": "PUT",
            "posId": records[0]["id"],
        }
    })
}

async fn stored_record(durable: &Arc<MemoryStore>) -> Value {
    let mut positions = PositionStore::new(durable.clone());
    positions.load().await.unwrap();
    serde_json::to_value(&positions.get("ESH2026")[0]).unwrap()
}

#[tokio::test]
async fn test_pinned_tab_refreshes_position_from_scrape() {
    let (durable, records) = stored_position().await;
    let host = Arc::new(FakeHost::new(FakeChain::new()).with_tab("panel", CALCULATOR_URL));
    let background = background(host.clone(), durable.clone(), CollectionConfig::immediate());

    let response = background.handle(open_pinned(&records), Some(TabId::from("panel"))).await;
    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.data.unwrap()["tabId"], "100");
    background.wait_for_pinned_tabs().await;

    let opened = host.opened.lock().unwrap().clone();
    assert_eq!(opened.len(), 1);
    assert!(opened[0].0.contains("series=20260123"));
    assert!(!opened[0].1);

    let updates = host.sent_to("panel");
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0]["action"], "updatePositionData");
    assert_eq!(updates[0]["posId"], records[0]["id"]);
    assert_eq!(updates[0]["newExp"], "Jan 23");
    assert_eq!(updates[0]["data"]["putBid"], 11.0);
    assert_eq!(updates[0]["data"]["callBid"], 10.0);
    assert_eq!(host.closed(), vec![TabId::from("100")]);

    let record = stored_record(&durable).await;
    assert_eq!(record["id"], records[0]["id"]);
    assert_eq!(record["expirationLabel"], "Jan 23");
    assert_eq!(record["bid"], 11.0);
    assert_eq!(record["volume"], 200);
}

#[tokio::test]
async fn test_pinned_tab_report_wins_over_scrape() {
    let (durable, records) = stored_position().await;
    let host = Arc::new(FakeHost::new(FakeChain::slow_to_render()).with_tab("panel", CALCULATOR_URL));
    let background = background(host.clone(), durable.clone(), CollectionConfig::immediate());

    let response = background.handle(open_pinned(&records), Some(TabId::from("panel"))).await;
    let pinned = TabId::from(response.data.unwrap()["tabId"].as_str().unwrap());

    let report = json!({
        "action": "pinnedTabData",
        "payload": { "data": { "putBid": 42.5, "putAsk": 43.0, "putPrice": 42.75, "putVolume": "1.2K", "putIv": 0.19 } }
    });
    let response = background.handle(report, Some(pinned.clone())).await;
    assert!(response.success, "{:?}", response.error);
    let data = response.data.unwrap();
    assert_eq!(data["updated"], true);
    assert_eq!(data["delivered"], true);

    host.chain.ready_gate.add_permits(1);
    background.wait_for_pinned_tabs().await;

    let updates = host.sent_to("panel");
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0]["data"]["putBid"], 42.5);
    assert_eq!(host.closed(), vec![pinned]);

    let record = stored_record(&durable).await;
    assert_eq!(record["bid"], 42.5);
    assert_eq!(record["volume"], 1200);
}

#[tokio::test]
async fn test_pinned_data_from_unknown_tab_is_rejected() {
    let host = Arc::new(FakeHost::new(FakeChain::new()).with_tab("panel", CALCULATOR_URL));
    let background = background(host.clone(), Arc::new(MemoryStore::new()), CollectionConfig::immediate());

    let report = json!({ "action": "pinnedTabData", "payload": { "data": { "callBid": 1.0 } } });
    let response = background.handle(report.clone(), Some(TabId::from("panel"))).await;
    assert!(!response.success);
    assert!(response.error.unwrap().contains("no pending request"));

    assert!(!background.handle(report, None).await.success);
    assert!(host.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unrendered_pinned_tab_is_closed_untouched() {
    let (durable, records) = stored_position().await;
    let host = Arc::new(FakeHost::new(FakeChain::never_renders()).with_tab("panel", CALCULATOR_URL));
    let background = background(host.clone(), durable.clone(), CollectionConfig::immediate());

    assert!(background.handle(open_pinned(&records), Some(TabId::from("panel"))).await.success);
    background.wait_for_pinned_tabs().await;

    assert_eq!(host.closed(), vec![TabId::from("100")]);
    assert!(host.sent_to("panel").is_empty());

    let record = stored_record(&durable).await;
    assert_eq!(record["expirationLabel"], "2026-01-16");
    assert_eq!(record["bid"], 20.0);
}
