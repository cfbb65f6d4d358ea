// Copyright (c) 2026 The Trireme developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use percent_encoding::percent_decode_str;

/// Parses a query string (the part of the target after `?`, without the
/// `?` itself) into an ordered list of parameters.
///
/// Parameters are separated by `&` and split on the first `=`; a parameter
/// without `=` gets an empty value. Both names and values are
/// percent-decoded. Empty segments (`a=1&&b=2`) are skipped.
pub fn parse_query(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|segment| !segment.is_empty())
        .map(|segment| match segment.find('=') {
            Some(pos) => (
                percent_decode(&segment[..pos]),
                percent_decode(&segment[pos + 1..]),
            ),
            None => (percent_decode(segment), String::new()),
        })
        .collect()
}

fn percent_decode(component: &str) -> String {
    percent_decode_str(component)
        .decode_utf8_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::parse_query;

    #[test]
    fn basic_pairs_keep_order() {
        let params = parse_query("a=1&b=2&a=3");
        assert_eq!(
            params,
            vec![
                ("a".to_owned(), "1".to_owned()),
                ("b".to_owned(), "2".to_owned()),
                ("a".to_owned(), "3".to_owned()),
            ]
        );
    }

    #[test]
    fn missing_equals_yields_empty_value() {
        let params = parse_query("debug&name=");
        assert_eq!(
            params,
            vec![
                ("debug".to_owned(), "".to_owned()),
                ("name".to_owned(), "".to_owned()),
            ]
        );
    }

    #[test]
    fn percent_decoding_applies_to_both_sides() {
        let params = parse_query("em%61il=user%40example.com");
        assert_eq!(
            params,
            vec![("email".to_owned(), "user@example.com".to_owned())]
        );
    }

    #[test]
    fn only_first_equals_splits() {
        let params = parse_query("expr=a%3Db=c");
        assert_eq!(params, vec![("expr".to_owned(), "a=b=c".to_owned())]);
    }

    #[test]
    fn empty_segments_are_skipped() {
        let params = parse_query("a=1&&b=2&");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn empty_query_is_empty() {
        assert!(parse_query("").is_empty());
    }
}
