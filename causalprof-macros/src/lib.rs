//! Procedural macros for the causalprof causal profiler.
//!
//! This crate provides the `#[profile]` attribute macro, re-exported as
//! `causalprof::profile`.

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{parse_macro_input, ItemFn};

/// Makes every call of a function one unit of progress.
///
/// The body runs inside a `causalprof::unit()` guard, so the unit ends when
/// the function returns, unwinds or returns early.
///
/// # Example
///
/// ```ignore
/// use causalprof::profile;
///
/// #[profile]
/// fn process_request(req: Request) -> Response {
///     // ... process the request ...
/// }
/// ```
///
/// The above expands to:
///
/// ```ignore
/// fn process_request(req: Request) -> Response {
///     let __causalprof_unit = ::causalprof::unit();
///     // ... process the request ...
/// }
/// ```
///
/// `async fn` is rejected: a unit must begin and end on the same thread,
/// which an executor does not guarantee.
#[proc_macro_attribute]
pub fn profile(attr: TokenStream, item: TokenStream) -> TokenStream {
    if !attr.is_empty() {
        return syn::Error::new(Span::call_site(), "#[profile] takes no arguments")
            .to_compile_error()
            .into();
    }

    let input = parse_macro_input!(item as ItemFn);
    if let Some(asyncness) = &input.sig.asyncness {
        return syn::Error::new_spanned(asyncness, "#[profile] cannot be applied to async fn")
            .to_compile_error()
            .into();
    }

    let attrs = &input.attrs;
    let vis = &input.vis;
    let sig = &input.sig;
    let stmts = &input.block.stmts;

    let expanded = quote! {
        #(#attrs)*
        #vis #sig {
            let __causalprof_unit = ::causalprof::unit();
            #(#stmts)*
        }
    };

    TokenStream::from(expanded)
}
