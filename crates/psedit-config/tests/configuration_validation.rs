use rstest::rstest;

use psedit_config::{Config, ConfigValidationError};

#[rstest]
fn default_configuration_is_valid() {
    assert_eq!(Config::default().validate(), Ok(()));
}

#[rstest]
fn rejects_zero_frame_depth() {
    let config = Config {
        max_frame_depth: 0,
        ..Config::default()
    };
    assert_eq!(config.validate(), Err(ConfigValidationError::ZeroFrameDepth));
}

#[rstest]
fn rejects_blank_module_names() {
    let config = Config {
        required_modules: vec![String::from("PSReadLine"), String::from("  ")],
        ..Config::default()
    };
    assert!(matches!(
        config.validate(),
        Err(ConfigValidationError::BlankModuleName { .. })
    ));
}

#[rstest]
#[case(true, 1)]
#[case(false, 0)]
fn honours_profile_toggle(#[case] load_profiles: bool, #[case] expected: usize) {
    let config = Config {
        load_profiles,
        profile_paths: vec!["/home/user/profile.ps1".into()],
        ..Config::default()
    };
    assert_eq!(config.effective_profile_paths().len(), expected);
}
