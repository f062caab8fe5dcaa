//! Topic routing-key matching.

/// Matches a routing key against a topic binding pattern.
///
/// Words are separated by `.`; `*` matches exactly one word and `#` matches
/// zero or more words, as on an AMQP topic exchange.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) => (word == "*" || word == head) && match_words(rest, tail),
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(topic_matches("payment.processed", "payment.processed"));
        assert!(!topic_matches("payment.processed", "payment.failed"));
    }

    #[test]
    fn star_matches_one_word() {
        assert!(topic_matches("payment.*", "payment.failed"));
        assert!(!topic_matches("payment.*", "payment"));
        assert!(!topic_matches("stock.*", "stock.reservation.failed"));
    }

    #[test]
    fn hash_matches_zero_or_more_words() {
        assert!(topic_matches("stock.#", "stock.reserved"));
        assert!(topic_matches("stock.#", "stock.reservation.failed"));
        assert!(topic_matches("stock.#", "stock"));
        assert!(topic_matches("#", "order.created"));
        assert!(topic_matches("#.failed", "stock.reservation.failed"));
        assert!(!topic_matches("#.failed", "stock.reserved"));
    }

    #[test]
    fn mixed_wildcards() {
        assert!(topic_matches("*.reservation.#", "stock.reservation.failed"));
        assert!(!topic_matches("*.reservation.#", "payment.processed"));
    }
}
