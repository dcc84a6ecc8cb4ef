use const_format::formatcp;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const GIT_SHA: &str = env!("VERGEN_GIT_SHA");
const BUILD_DATE: &str = env!("VERGEN_BUILD_DATE");
const TARGET_TRIPLE: &str = env!("VERGEN_CARGO_TARGET_TRIPLE");

/// `-V` と起動ログに出すバージョン。
pub const fn short_version() -> &'static str {
    formatcp!("{VERSION} ({GIT_SHA})")
}

/// `--version` で出す、ビルド情報を含むバージョン。
pub const fn long_version() -> &'static str {
    formatcp!("{VERSION}\ncommit: {GIT_SHA}\nbuilt: {BUILD_DATE}\ntarget: {TARGET_TRIPLE}")
}
