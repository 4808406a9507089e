use pairs_analytics::interval::Interval;
use smol_str::SmolStr;
use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};
use tracing::warn;

/// Runtime settings of the server binary. Analytics settings live in
/// [`EngineConfig`](pairs_analytics::EngineConfig).
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Upstream trade stream URL, `{symbol}` is replaced by the lower-case symbol.
    pub feed_url: String,
    pub symbols: Vec<SmolStr>,
    /// `(symbol_x, symbol_y)` pairs refreshed proactively.
    pub pairs: Vec<(SmolStr, SmolStr)>,
    pub analytics_interval: Interval,
    /// Bars per analytics window, `0` uses the engine default.
    pub window_len: usize,
    pub listen_addr: SocketAddr,
    pub db_path: PathBuf,
    pub refresh_interval: Duration,
    pub status_interval: Duration,
    pub broadcast_buffer: usize,
    pub frame_buffer: usize,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let pairs = vec![(SmolStr::new("BTCUSDT"), SmolStr::new("ETHUSDT"))];
        Self {
            feed_url: "wss://fstream.binance.com/ws/{symbol}@trade".to_string(),
            symbols: symbols_of(&pairs),
            pairs,
            analytics_interval: Interval::M1,
            window_len: 0,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9001)),
            db_path: PathBuf::from("data/bars.db"),
            refresh_interval: Duration::from_secs(5),
            status_interval: Duration::from_secs(10),
            broadcast_buffer: 1_024,
            frame_buffer: 10_000,
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(8),
        }
    }
}

impl ServerConfig {
    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("PAIRS_FEED_URL") {
            config.feed_url = url;
        }
        if let Ok(raw) = std::env::var("PAIRS_PAIRS") {
            match parse_pairs(&raw) {
                Ok(pairs) if !pairs.is_empty() => {
                    config.symbols = symbols_of(&pairs);
                    config.pairs = pairs;
                }
                Ok(_) => warn!("PAIRS_PAIRS is empty, keeping defaults"),
                Err(error) => warn!(%error, "invalid PAIRS_PAIRS, keeping defaults"),
            }
        }
        if let Ok(raw) = std::env::var("PAIRS_SYMBOLS") {
            let mut symbols = parse_symbols(&raw);
            for symbol in symbols_of(&config.pairs) {
                if !symbols.contains(&symbol) {
                    symbols.push(symbol);
                }
            }
            config.symbols = symbols;
        }
        if let Some(interval) = env_parse("PAIRS_ANALYTICS_INTERVAL") {
            config.analytics_interval = interval;
        }
        if let Some(window_len) = env_parse("PAIRS_WINDOW") {
            config.window_len = window_len;
        }
        if let Some(addr) = env_parse("WS_ADDR") {
            config.listen_addr = addr;
        }
        if let Ok(path) = std::env::var("PAIRS_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(secs) = env_parse::<u64>("PAIRS_REFRESH_SECS") {
            config.refresh_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env_parse::<u64>("PAIRS_STATUS_SECS") {
            config.status_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(size) = env_parse("WS_BUFFER_SIZE") {
            config.broadcast_buffer = size;
        }

        config
    }

    /// Upstream URL of one symbol's trade stream.
    pub fn feed_url_for(&self, symbol: &str) -> String {
        self.feed_url.replace("{symbol}", &symbol.to_ascii_lowercase())
    }
}

/// Parse `"BTCUSDT/ETHUSDT,SOLUSDT/ETHUSDT"` into upper-case symbol pairs.
pub fn parse_pairs(raw: &str) -> Result<Vec<(SmolStr, SmolStr)>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            pair.split_once('/')
                .map(|(x, y)| (normalise(x), normalise(y)))
                .filter(|(x, y)| !x.is_empty() && !y.is_empty() && x != y)
                .ok_or_else(|| format!("expected <SYMBOL_X>/<SYMBOL_Y>, got {pair}"))
        })
        .collect()
}

fn parse_symbols(raw: &str) -> Vec<SmolStr> {
    let mut symbols = Vec::new();
    for symbol in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let symbol = normalise(symbol);
        if !symbols.contains(&symbol) {
            symbols.push(symbol);
        }
    }
    symbols
}

fn symbols_of(pairs: &[(SmolStr, SmolStr)]) -> Vec<SmolStr> {
    let mut symbols = Vec::new();
    for (x, y) in pairs {
        for symbol in [x, y] {
            if !symbols.contains(symbol) {
                symbols.push(symbol.clone());
            }
        }
    }
    symbols
}

fn normalise(symbol: &str) -> SmolStr {
    SmolStr::new(symbol.trim().to_ascii_uppercase())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}
