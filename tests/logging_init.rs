use spectro_align::{config::LoggingSettings, logging};

#[test]
fn test_second_init_is_a_noop() {
    let settings = LoggingSettings {
        level: "debug".to_string(),
        json: true,
    };
    assert!(logging::init(&settings).unwrap());
    assert!(!logging::init(&settings).unwrap());
}
