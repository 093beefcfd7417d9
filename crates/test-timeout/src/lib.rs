//! Test attributes that run the test body on a watchdog thread and fail the
//! test when it does not finish within the deadline.
//!
//! ```ignore
//! #[test_timeout::timeout]
//! fn sync_test() {}
//!
//! #[test_timeout::tokio_timeout_test(10, flavor = "multi_thread")]
//! async fn async_test() {}
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, LitStr, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    CurrentThread,
    MultiThread,
}

struct TimeoutArgs {
    secs: u64,
    flavor: Flavor,
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            secs: DEFAULT_TIMEOUT_SECS,
            flavor: Flavor::CurrentThread,
        };

        while !input.is_empty() {
            if input.peek(LitInt) {
                let lit: LitInt = input.parse()?;
                let secs: u64 = lit.base10_parse()?;
                if secs == 0 {
                    return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
                }
                args.secs = secs;
            } else {
                let name: Ident = input.parse()?;
                input.parse::<Token![=]>()?;
                let value: LitStr = input.parse()?;
                if name != "flavor" {
                    return Err(syn::Error::new_spanned(name, "expected `flavor = \"...\"`"));
                }
                args.flavor = match value.value().as_str() {
                    "current_thread" => Flavor::CurrentThread,
                    "multi_thread" => Flavor::MultiThread,
                    _ => {
                        return Err(syn::Error::new_spanned(
                            value,
                            "flavor must be \"current_thread\" or \"multi_thread\"",
                        ))
                    }
                };
            }

            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }

        Ok(args)
    }
}

/// Wraps `body` (an expression evaluated on the watchdog thread) in the
/// catch-unwind / deadline harness shared by both attributes.
fn watchdog(attrs: Vec<Attribute>, item: &ItemFn, secs: u64, body: TokenStream2) -> TokenStream2 {
    let vis = &item.vis;
    let sig = &item.sig;
    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #body));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test timed out after {}s", #secs)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let mut item = parse_macro_input!(item as ItemFn);

    if item.sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &item.sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    item.sig.asyncness = None;

    let attrs: Vec<Attribute> = std::mem::take(&mut item.attrs)
        .into_iter()
        .filter(|attr| !is_path(attr, &["tokio", "test"]))
        .collect();
    let block = &item.block;
    let builder = match args.flavor {
        Flavor::CurrentThread => quote!(tokio::runtime::Builder::new_current_thread()),
        Flavor::MultiThread => quote! {
            tokio::runtime::Builder::new_multi_thread().worker_threads(4)
        },
    };
    let body = quote! {{
        let runtime = #builder
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            tokio::time::timeout(timeout_duration, async move #block)
                .await
                .expect("test timed out");
        });
    }};

    watchdog(attrs, &item, args.secs, body).into()
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let mut item = parse_macro_input!(item as ItemFn);

    if item.sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &item.sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }
    if args.flavor == Flavor::MultiThread {
        return syn::Error::new_spanned(
            &item.sig.ident,
            "flavor only applies to tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }

    let attrs: Vec<Attribute> = std::mem::take(&mut item.attrs)
        .into_iter()
        .filter(|attr| !is_path(attr, &["test"]))
        .collect();
    let block = &item.block;
    let body = quote!(#block);

    watchdog(attrs, &item, args.secs, body).into()
}

fn is_path(attr: &Attribute, expected: &[&str]) -> bool {
    let segments: Vec<_> = attr.path().segments.iter().collect();
    segments.len() == expected.len()
        && segments
            .iter()
            .zip(expected)
            .all(|(segment, name)| segment.ident == name)
}
