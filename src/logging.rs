//! ログ設定

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// `RUST_LOG` 未指定時のフィルタ
pub const DEFAULT_FILTER: &str = "skin_lesion_classifier=info";

/// tracing サブスクライバを初期化
///
/// 2回目以降の呼び出しは何もしません。
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .try_init()
        .ok();
}
