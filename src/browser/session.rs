use crate::browser::config::{ConnectionOptions, LaunchOptions};
use crate::dom::{DomTree, ExpirationRef, extract_expirations, is_chain_ready};
use crate::error::{BridgeError, Result};
use crate::scrape::{ParsedPage, parse_chain};
use headless_chrome::{Browser, Tab};
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

/// Browser session that manages a Chrome/Chromium instance
pub struct BrowserSession {
    browser: Browser,
}

impl BrowserSession {
    /// Launch a new browser instance with the given options
    pub fn launch(options: LaunchOptions) -> Result<Self> {
        let mut launch_opts = headless_chrome::LaunchOptions::default();

        // Chain pages refuse to render for automation-flagged browsers
        launch_opts.ignore_default_args.push(OsStr::new("--enable-automation"));
        launch_opts.args.push(OsStr::new("--disable-blink-features=AutomationControlled"));

        // A collection can sit on one page for minutes
        launch_opts.idle_browser_timeout = Duration::from_secs(60 * 60);

        launch_opts.headless = options.headless;
        launch_opts.window_size = Some((options.window_width, options.window_height));
        launch_opts.path = options.chrome_path;
        launch_opts.user_data_dir = options.user_data_dir;
        launch_opts.sandbox = options.sandbox;

        let browser = Browser::new(launch_opts).map_err(|e| BridgeError::LaunchFailed(e.to_string()))?;
        browser
            .new_tab()
            .map_err(|e| BridgeError::LaunchFailed(format!("Failed to create tab: {}", e)))?;

        log::info!("Launched browser (headless: {})", options.headless);
        Ok(Self { browser })
    }

    /// Connect to an existing browser instance via WebSocket
    pub fn connect(options: ConnectionOptions) -> Result<Self> {
        let browser = Browser::connect_with_timeout(options.ws_url.clone(), Duration::from_millis(options.timeout))
            .map_err(|e| BridgeError::ConnectionFailed(format!("{}: {}", options.ws_url, e)))?;

        log::info!("Connected to browser at {}", options.ws_url);
        Ok(Self { browser })
    }

    pub fn browser(&self) -> &Browser {
        &self.browser
    }

    /// Create a new tab
    pub fn new_tab(&self) -> Result<Arc<Tab>> {
        self.browser
            .new_tab()
            .map_err(|e| BridgeError::TabOperationFailed(format!("Failed to create tab: {}", e)))
    }

    /// Get all tabs
    pub fn get_tabs(&self) -> Result<Vec<Arc<Tab>>> {
        let tabs = self
            .browser
            .get_tabs()
            .lock()
            .map_err(|e| BridgeError::TabOperationFailed(format!("Failed to get tabs: {}", e)))?
            .clone();

        Ok(tabs)
    }

    /// Find a tab by its DevTools target id
    pub fn find_tab(&self, target_id: &str) -> Result<Option<Arc<Tab>>> {
        Ok(self.get_tabs()?.into_iter().find(|tab| tab.get_target_id() == target_id))
    }

    /// First tab whose URL starts with `prefix`
    pub fn find_tab_by_url(&self, prefix: &str) -> Result<Option<Arc<Tab>>> {
        Ok(self.get_tabs()?.into_iter().find(|tab| tab.get_url().starts_with(prefix)))
    }

    /// Get the currently active tab by checking the document visibility and focus state
    pub fn get_active_tab(&self) -> Result<Arc<Tab>> {
        let tabs = self.get_tabs()?;

        for check in [
            "document.visibilityState === 'visible' && document.hasFocus()",
            "document.visibilityState === 'visible'",
        ] {
            for tab in &tabs {
                match tab.evaluate(check, false) {
                    Ok(remote_object) => {
                        if remote_object.value.and_then(|v| v.as_bool()).unwrap_or(false) {
                            return Ok(tab.clone());
                        }
                    }
                    Err(e) => log::debug!("Failed to check tab status: {}", e),
                }
            }
        }

        Err(BridgeError::TabOperationFailed("No active tab found".to_string()))
    }

    /// The active tab if it shows an option chain, else the first chain tab
    pub fn find_chain_tab(&self) -> Result<Arc<Tab>> {
        if let Ok(tab) = self.get_active_tab() {
            if tab.get_url().contains("/options/chain/") {
                return Ok(tab);
            }
        }
        self.get_tabs()?
            .into_iter()
            .find(|tab| tab.get_url().contains("/options/chain/"))
            .ok_or_else(|| BridgeError::TabOperationFailed("No option chain tab open".to_string()))
    }

    /// Navigate a tab and wait for the load to finish
    pub fn navigate(tab: &Tab, url: &str) -> Result<()> {
        tab.navigate_to(url)
            .map_err(|e| BridgeError::NavigationFailed(format!("Failed to navigate to {}: {}", url, e)))?;
        tab.wait_until_navigated()
            .map_err(|e| BridgeError::NavigationFailed(format!("Navigation timeout: {}", e)))?;
        Ok(())
    }

    /// Extract the chain DOM from a tab
    pub fn extract_dom(tab: &Arc<Tab>) -> Result<DomTree> {
        DomTree::from_tab(tab)
    }

    /// Extract and parse the chain shown in a tab
    pub fn parse_tab(tab: &Arc<Tab>) -> Result<ParsedPage> {
        parse_chain(&DomTree::from_tab(tab)?)
    }

    pub fn expirations(tab: &Arc<Tab>) -> Result<Vec<ExpirationRef>> {
        extract_expirations(tab)
    }

    pub fn is_chain_ready(tab: &Arc<Tab>) -> Result<bool> {
        is_chain_ready(tab)
    }

    /// Close every tab; the browser process exits when the session is dropped
    pub fn close(&self) -> Result<()> {
        for tab in self.get_tabs()? {
            let _ = tab.close(false);
        }
        Ok(())
    }
}
