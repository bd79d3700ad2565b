//! Clusters failures by the identity of the failing test.

use super::hash_id;
use crate::model::Failure;

pub const NAME: &str = "testname-v4";

pub fn cluster(failure: &Failure) -> Option<String> {
    Some(hash_id(&failure.test_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::failure;

    #[test]
    fn id_is_a_hash_of_the_test_id() {
        let id = cluster(&failure("ninja://test_name/1", None)).unwrap();
        assert_eq!(id, "13d1df0296adafcf0ff286097537f502");
    }

    #[test]
    fn same_test_same_cluster() {
        let a = cluster(&failure("ninja://a", Some("x"))).unwrap();
        let b = cluster(&failure("ninja://a", Some("y"))).unwrap();
        let c = cluster(&failure("ninja://b", Some("x"))).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
