//! `#[test_timeout::timeout]`: a test attribute with a watchdog.
//!
//! Proxy tests hold real sockets and WebSocket read loops; when one
//! deadlocks, the plain test harness hangs forever. This attribute runs the
//! test body on its own thread and fails it after a deadline instead.
//!
//! Works on both synchronous and `async` test functions. Async bodies get a
//! current-thread tokio runtime, so `#[tokio::test]` is not needed (and is
//! filtered out if present). The default deadline is 60 seconds; pass a
//! literal number of seconds to override: `#[test_timeout::timeout(5)]`.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut timeout_secs: u64 = 60;
    if !attr.is_empty() {
        let lit = parse_macro_input!(attr as LitInt);
        timeout_secs = lit
            .base10_parse()
            .unwrap_or_else(|err| panic!("invalid timeout value: {err}"));
        if timeout_secs == 0 {
            panic!("timeout must be greater than zero");
        }
    }

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    let is_async = sig.asyncness.take().is_some();

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();

    let run_body = if is_async {
        quote! {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build tokio runtime");
            runtime.block_on(async move #block);
        }
    } else {
        quote! { #block }
    };

    let timeout = timeout_secs;
    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let deadline = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    #run_body
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(deadline) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test timed out after {deadline:?}")
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread died before reporting a result")
                }
            }
        }
    })
}

/// Filters `#[test]` and `#[tokio::test]` so the expansion's own `#[test]`
/// is the only harness entry point.
fn is_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    match (segments.next(), segments.next(), segments.next()) {
        (Some(only), None, None) => only.ident == "test",
        (Some(first), Some(second), None) => first.ident == "tokio" && second.ident == "test",
        _ => false,
    }
}
