//! Confirmation phrases and the read-only query guard

use branchsync_core::{ensure_read_only, Branch, Confirmation, EngineError};

#[test]
fn test_read_only_accepts_select_and_with() {
    assert!(ensure_read_only("SELECT * FROM products").is_ok());
    assert!(ensure_read_only("  select id from orders where note = 'please delete me';").is_ok());
    assert!(ensure_read_only("WITH recent AS (SELECT * FROM orders) SELECT count(*) FROM recent").is_ok());
    assert!(ensure_read_only("-- comment first\nSELECT 1").is_ok());
    assert!(ensure_read_only("SELECT \"update\" FROM audit").is_ok());
}

#[test]
fn test_read_only_rejects_writes() {
    for sql in [
        "DELETE FROM orders",
        "UPDATE products SET price = 0",
        "DROP TABLE orders",
        "WITH gone AS (DELETE FROM orders RETURNING *) SELECT * FROM gone",
        "SELECT * FROM orders FOR UPDATE",
        "SELECT 1; DROP TABLE orders",
        "TRUNCATE orders",
    ] {
        let err = ensure_read_only(sql).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)), "{sql}");
    }
}

#[test]
fn test_read_only_rejects_empty() {
    assert!(ensure_read_only("   ").is_err());
    assert!(ensure_read_only("/* nothing */").is_err());
}

#[test]
fn test_confirmation_phrases() {
    assert_eq!(Confirmation::rollback(Branch::Prod).phrase(), "ROLLBACK PROD");
    assert_eq!(Confirmation::rollback(Branch::Dev).phrase(), "ROLLBACK DEV");
    assert_eq!(Confirmation::sync(Branch::Prod).phrase(), "SYNC TO PROD");
}

#[test]
fn test_confirmation_verify() {
    let c = Confirmation::rollback(Branch::Prod);
    assert!(c.verify("ROLLBACK PROD").is_ok());
    assert!(c.verify("  ROLLBACK PROD\n").is_ok());
    assert!(c.verify("rollback prod").is_err());
    assert!(c.verify("ROLLBACK DEV").is_err());
}

#[test]
fn test_confirmation_only_enforced_on_protected_branch() {
    let dev = Confirmation::sync(Branch::Dev);
    assert!(dev.verify_if_protected(Branch::Dev, None).is_ok());
    let prod = Confirmation::sync(Branch::Prod);
    assert!(prod.verify_if_protected(Branch::Prod, None).is_err());
    assert!(prod.verify_if_protected(Branch::Prod, Some("SYNC TO PROD")).is_ok());
}
