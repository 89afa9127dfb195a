use crate::api::{FollowupRequestId, LocalizationId, NoticeId, UserId};

#[test]
fn test_user_id_new_and_value() {
    let id = UserId::new(42);
    assert_eq!(id.value(), 42);
    assert_eq!(i64::from(id), 42);
}

#[test]
fn test_localization_id_ordering() {
    let a = LocalizationId::new(1);
    let b = LocalizationId::new(2);
    assert!(a < b);
    assert_eq!(a, LocalizationId::from(1));
}

#[test]
fn test_id_display() {
    assert_eq!(NoticeId(7).to_string(), "7");
    assert_eq!(format!("request {}", FollowupRequestId(12)), "request 12");
}

#[test]
fn test_id_serializes_as_plain_number() {
    let json = serde_json::to_string(&LocalizationId(99)).unwrap();
    assert_eq!(json, "99");
    let back: LocalizationId = serde_json::from_str(&json).unwrap();
    assert_eq!(back, LocalizationId(99));
}

#[test]
fn test_id_from_path_segment() {
    assert_eq!(" 12 ".parse::<FollowupRequestId>().unwrap(), FollowupRequestId(12));
    assert!("twelve".parse::<FollowupRequestId>().is_err());
}
