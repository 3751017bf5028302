//! Fuzz target: `Response::decode`
//!
//! Any payload that parses must re-encode to a payload that parses to the
//! same response.
//!
//! cargo fuzz run fuzz_response_decode

#![no_main]

use libfuzzer_sys::fuzz_target;
use sparkhost::rpc::command::Response;

fuzz_target!(|data: &[u8]| {
    if let Ok(response) = Response::decode(data) {
        let again = Response::decode(&response.encode()).expect("re-encoded response must parse");
        assert_eq!(again, response);
    }
});
