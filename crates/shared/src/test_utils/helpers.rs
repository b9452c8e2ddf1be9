use std::sync::Once;

pub fn get_workspace_root() -> String {
    let crate_root = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    crate_root
        .parent() // up from shared/
        .and_then(|p| p.parent()) // up from crates/
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|| crate_root.to_string_lossy().to_string())
}

pub struct TestContext {
    pub workspace_root: String,
    pub crate_root: String,
}

pub static INIT_TEST_ONCE: Once = Once::new();

/// Loads env files and installs logging once per test binary.
#[macro_export]
macro_rules! setup_test {
    () => {{
        $crate::test_utils::helpers::INIT_TEST_ONCE.call_once(|| {
            $crate::env::load_optional_env_files();
            $crate::logging::configure_logging().unwrap();
        });

        let crate_root = env!("CARGO_MANIFEST_DIR");
        let workspace_root = $crate::test_utils::helpers::get_workspace_root();

        $crate::test_utils::helpers::TestContext {
            workspace_root,
            crate_root: crate_root.to_string(),
        }
    }};
}
