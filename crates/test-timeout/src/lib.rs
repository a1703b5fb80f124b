//! `#[tokio_timeout_test]`: run an async test on its own current-thread runtime
//! with a hard wall-clock deadline.
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test]            // 60s deadline
//! #[test_timeout::tokio_timeout_test(10)]        // 10s deadline
//! #[test_timeout::tokio_timeout_test(10, paused)] // paused Tokio clock
//! ```
//!
//! With `paused` the runtime starts with a frozen clock that auto-advances while
//! idle, so the deadline is enforced on the wall clock only. The calling crate
//! needs tokio's `test-util` feature for that mode.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{Attribute, Ident, ItemFn, LitInt, Token, parse_macro_input};

const DEFAULT_DEADLINE_SECS: u64 = 60;

struct TestArgs {
    deadline_secs: u64,
    paused: bool,
}

enum TestArg {
    Deadline(LitInt),
    Paused,
}

impl Parse for TestArg {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.peek(LitInt) {
            return Ok(TestArg::Deadline(input.parse()?));
        }
        let ident: Ident = input.parse()?;
        if ident == "paused" {
            Ok(TestArg::Paused)
        } else {
            Err(syn::Error::new_spanned(
                ident,
                "expected a deadline in seconds or `paused`",
            ))
        }
    }
}

impl Parse for TestArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TestArgs {
            deadline_secs: DEFAULT_DEADLINE_SECS,
            paused: false,
        };
        for arg in Punctuated::<TestArg, Token![,]>::parse_terminated(input)? {
            match arg {
                TestArg::Deadline(lit) => {
                    let secs: u64 = lit.base10_parse()?;
                    if secs == 0 {
                        return Err(syn::Error::new_spanned(
                            lit,
                            "deadline must be greater than zero",
                        ));
                    }
                    args.deadline_secs = secs;
                }
                TestArg::Paused => args.paused = true,
            }
        }
        Ok(args)
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TestArgs);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let deadline = args.deadline_secs;
    let body: TokenStream2 = if args.paused {
        quote! { runtime.block_on(async move #block); }
    } else {
        quote! {
            runtime.block_on(async {
                tokio::time::timeout(deadline, async move #block)
                    .await
                    .expect("test exceeded its deadline");
            });
        }
    };
    let builder: TokenStream2 = if args.paused {
        quote! { tokio::runtime::Builder::new_current_thread().enable_all().start_paused(true) }
    } else {
        quote! { tokio::runtime::Builder::new_current_thread().enable_all() }
    };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let deadline = std::time::Duration::from_secs(#deadline);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = #builder
                        .build()
                        .expect("failed to build Tokio runtime");
                    #body
                }));
                let _ = sender.send(outcome);
            });
            match receiver.recv_timeout(deadline) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded its {}s deadline", #deadline)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited before reporting a result")
                }
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
