use vergen_gitcl::{BuildBuilder, CargoBuilder, Emitter, GitclBuilder};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let build = BuildBuilder::default().build_date(true).build()?;
    let cargo = CargoBuilder::default().target_triple(true).build()?;
    let gitcl = GitclBuilder::default().sha(true).build()?;

    let emitted = Emitter::default()
        .add_instructions(&build)?
        .add_instructions(&cargo)?
        .add_instructions(&gitcl)?
        .emit();

    // ソースアーカイブからのビルドなど git が使えない場合
    if emitted.is_err() {
        emit_fallback("VERGEN_BUILD_DATE", "unknown");
        emit_fallback("VERGEN_CARGO_TARGET_TRIPLE", "unknown");
        let sha = std::env::var("GITHUB_SHA")
            .map(|sha| sha.chars().take(7).collect())
            .unwrap_or_else(|_| "unknown".to_string());
        emit_fallback("VERGEN_GIT_SHA", &sha);
    }

    Ok(())
}

fn emit_fallback(key: &str, value: &str) {
    println!("cargo::rustc-env={key}={value}");
}
