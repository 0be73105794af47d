use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, ItemFn};

/// Test attribute that installs the crate's tracing subscriber before the body runs.
///
/// Async tests expand to `#[tokio::test]` and forward any arguments, so
/// `#[aggwork::test(start_paused = true)]` gives a paused tokio clock.
/// Sync tests expand to a plain `#[test]`.
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = proc_macro2::TokenStream::from(attr);
    let input = parse_macro_input!(item as ItemFn);
    let vis = &input.vis;
    let sig = &input.sig;
    let block = &input.block;
    let name = &input.sig.ident;

    let tokio_args = if args.is_empty() {
        quote! {}
    } else {
        quote! { ( #args ) }
    };

    let output = if sig.asyncness.is_some() {
        quote! {
            #[tokio::test #tokio_args]
            #vis #sig {
                aggwork::trace::with_test_tracing(stringify!(#name), || async move #block).await
            }
        }
    } else {
        quote! {
            #[test]
            #vis #sig {
                aggwork::trace::with_test_tracing_sync(stringify!(#name), || #block)
            }
        }
    };
    output.into()
}
