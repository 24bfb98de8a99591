// calltrace_macro/src/lib.rs

use proc_macro::TokenStream;
use quote::{quote, ToTokens};
use syn::{
    parse_macro_input, parse_quote, Attribute, Block, Expr, FnArg, ImplItem, Item, ItemFn,
    ItemImpl, ItemTrait, Pat, ReturnType, Signature, Stmt, TraitItem, Type,
};

/// Wraps callables so every invocation reports its arguments, return value,
/// and panics through `calltrace_runtime`.
///
/// Applies to a single `fn`, to an `impl` block (wrapping each method and
/// associated function it owns), or to a trait definition (wrapping default
/// method bodies). Signatures are left untouched, so wrapped callables keep
/// their name, visibility, and calling convention.
///
/// ```ignore
/// #[calltrace_runtime::trace]
/// fn add(a: i32, b: i32) -> i32 {
///     a + b
/// }
/// ```
///
/// `async fn` and `const fn` cannot be wrapped: a direct annotation is a
/// compile error, and block-wide annotations skip them.
#[proc_macro_attribute]
pub fn trace(attr: TokenStream, item: TokenStream) -> TokenStream {
    let attr = proc_macro2::TokenStream::from(attr);
    if !attr.is_empty() {
        return syn::Error::new_spanned(attr, "#[trace] takes no arguments")
            .to_compile_error()
            .into();
    }

    let item = parse_macro_input!(item as Item);

    match expand_item(item) {
        Ok(tokens) => tokens.into(),
        Err(error) => error.to_compile_error().into(),
    }
}

fn expand_item(item: Item) -> Result<proc_macro2::TokenStream, syn::Error> {
    match item {
        Item::Fn(item_fn) => expand_fn(item_fn),
        Item::Impl(item_impl) => expand_impl(item_impl),
        Item::Trait(item_trait) => expand_trait(item_trait),
        other => Err(syn::Error::new_spanned(
            other,
            "#[trace] can only be applied to functions, impl blocks, and traits",
        )),
    }
}

fn expand_fn(mut item_fn: ItemFn) -> Result<proc_macro2::TokenStream, syn::Error> {
    if has_trace_attr(&item_fn.attrs) {
        // Another #[trace] is still pending on this item; let it do the wrapping.
        return Ok(quote! { #item_fn });
    }
    ensure_wrappable(&item_fn.sig)?;

    let details = CallableDetails::from_signature(&item_fn.sig, None);
    let body = build_traced_body(&details, &item_fn.sig, &item_fn.block);
    // Installed verbatim: re-parsing the body would make syn re-print the
    // generated closure's `||` as two spaced `|` tokens.
    item_fn.block = Box::new(Block {
        brace_token: Default::default(),
        stmts: vec![Stmt::Expr(Expr::Verbatim(body), None)],
    });

    Ok(quote! { #item_fn })
}

fn expand_impl(mut item_impl: ItemImpl) -> Result<proc_macro2::TokenStream, syn::Error> {
    if has_trace_attr(&item_impl.attrs) {
        return Ok(quote! { #item_impl });
    }
    let type_name = extract_type_name(&item_impl.self_ty);

    for item in &mut item_impl.items {
        if let ImplItem::Fn(method) = item {
            if has_trace_attr(&method.attrs) || !is_wrappable(&method.sig) {
                continue;
            }
            let details = CallableDetails::from_signature(&method.sig, type_name.as_deref());
            let body = build_traced_body(&details, &method.sig, &method.block);
            method.block = parse_quote!({ #body });
        }
    }

    Ok(quote! { #item_impl })
}

fn expand_trait(mut item_trait: ItemTrait) -> Result<proc_macro2::TokenStream, syn::Error> {
    if has_trace_attr(&item_trait.attrs) {
        return Ok(quote! { #item_trait });
    }
    let trait_name = item_trait.ident.to_string();

    for item in &mut item_trait.items {
        if let TraitItem::Fn(method) = item {
            if has_trace_attr(&method.attrs) || !is_wrappable(&method.sig) {
                continue;
            }
            // Signatures without a default body have nothing to wrap.
            let wrapped: Option<Block> = match &method.default {
                Some(block) => {
                    let details =
                        CallableDetails::from_signature(&method.sig, Some(&trait_name));
                    let body = build_traced_body(&details, &method.sig, block);
                    Some(parse_quote!({ #body }))
                }
                None => None,
            };
            if let Some(block) = wrapped {
                method.default = Some(block);
                method.semi_token = None;
            }
        }
    }

    Ok(quote! { #item_trait })
}

/// How the wrapped callable receives its instance, if at all.
enum ReceiverForm {
    Reference,
    Value,
}

struct CallableDetails {
    name: String,
    type_name: Option<String>,
    receiver: Option<ReceiverForm>,
    is_constructor: bool,
    arg_idents: Vec<syn::Ident>,
}

impl CallableDetails {
    fn from_signature(sig: &Signature, type_name: Option<&str>) -> CallableDetails {
        let name = sig.ident.to_string();
        let mut receiver = None;
        let mut arg_idents = Vec::new();

        for input in &sig.inputs {
            match input {
                FnArg::Receiver(r) => {
                    receiver = Some(if r.reference.is_some() {
                        ReceiverForm::Reference
                    } else {
                        ReceiverForm::Value
                    });
                }
                FnArg::Typed(pat_type) => {
                    // Pattern parameters have no display name; they are omitted
                    // from the reported argument list, never from the call.
                    if let Pat::Ident(pat_ident) = &*pat_type.pat {
                        arg_idents.push(pat_ident.ident.clone());
                    }
                }
            }
        }

        let is_constructor = type_name.is_some() && name == "new";

        CallableDetails {
            name,
            type_name: type_name.map(str::to_string),
            receiver,
            is_constructor,
            arg_idents,
        }
    }
}

fn build_traced_body(
    details: &CallableDetails,
    sig: &Signature,
    block: &Block,
) -> proc_macro2::TokenStream {
    let name = &details.name;
    let has_receiver = details.receiver.is_some();
    let type_name = match &details.type_name {
        Some(type_name) => quote! { ::core::option::Option::Some(#type_name) },
        None => quote! { ::core::option::Option::None },
    };

    let receiver_expr = match details.receiver {
        Some(ReceiverForm::Reference) => Some(quote! { &*self }),
        Some(ReceiverForm::Value) => Some(quote! { &self }),
        None => None,
    };

    let mut arg_entries = Vec::new();
    if let Some(receiver_expr) = &receiver_expr {
        if !details.is_constructor {
            arg_entries.push(quote! {
                ("self", ::calltrace_runtime::render_value!(#receiver_expr))
            });
        }
    }
    for ident in &details.arg_idents {
        let ident_name = ident.to_string();
        arg_entries.push(quote! {
            (#ident_name, ::calltrace_runtime::render_value!(&#ident))
        });
    }

    let capture_instance = match &receiver_expr {
        Some(receiver_expr) => quote! {
            __calltrace_instance = ::calltrace_runtime::instance_tag(#receiver_expr);
        },
        None => quote! {},
    };

    // The body moves into a closure, which costs it two things it had as a
    // fn body: the declared return type (a body that always panics would
    // otherwise leave the closure's type unresolved, and the return render
    // needs it concrete) and, for `unsafe fn`, the implicit unsafe context.
    // Both are restored here.
    let body_closure = match closure_return(&sig.output) {
        Some(output) if sig.unsafety.is_some() => {
            quote! { move || -> #output { unsafe #block } }
        }
        Some(output) => quote! { move || -> #output #block },
        None if sig.unsafety.is_some() => quote! { move || unsafe #block },
        None => quote! { move || #block },
    };

    quote! {
        static __CALLTRACE_TRACER: ::calltrace_runtime::TracerCell =
            ::calltrace_runtime::TracerCell::new();
        let __calltrace_tracer = __CALLTRACE_TRACER.get_or_init(|| {
            ::calltrace_runtime::CallTracer::from_spec(::calltrace_runtime::CallableSpec {
                name: #name,
                type_name: #type_name,
                has_receiver: #has_receiver,
            })
        });
        let __calltrace_suppressed = ::calltrace_runtime::is_formatting();
        #[allow(unused_mut)]
        let mut __calltrace_instance: u64 = 0;
        if !__calltrace_suppressed {
            #capture_instance
            __calltrace_tracer.log_call(__calltrace_instance, &[#(#arg_entries),*]);
        }
        match ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(#body_closure)) {
            ::std::result::Result::Ok(__calltrace_value) => {
                if !__calltrace_suppressed {
                    __calltrace_tracer.log_return(
                        __calltrace_instance,
                        ::calltrace_runtime::render_value!(&__calltrace_value),
                    );
                }
                __calltrace_value
            }
            ::std::result::Result::Err(__calltrace_panic) => {
                __calltrace_tracer.log_panic(__calltrace_instance, __calltrace_panic.as_ref());
                ::std::panic::resume_unwind(__calltrace_panic)
            }
        }
    }
}

/// The return annotation for the generated body closure: the signature's
/// type, with the empty return normalized to `()`. `impl Trait` returns come
/// back as `None` since a closure cannot name an opaque type.
fn closure_return(output: &ReturnType) -> Option<proc_macro2::TokenStream> {
    match output {
        ReturnType::Default => Some(quote! { () }),
        ReturnType::Type(_, ty) if contains_impl_trait(ty) => None,
        ReturnType::Type(_, ty) => Some(ty.to_token_stream()),
    }
}

// A token scan instead of a syntax walk: `impl` only ever appears inside a
// type as the opaque-type keyword, however deeply nested.
fn contains_impl_trait(ty: &Type) -> bool {
    fn scan(tokens: proc_macro2::TokenStream) -> bool {
        tokens.into_iter().any(|tree| match tree {
            proc_macro2::TokenTree::Ident(ident) => ident == "impl",
            proc_macro2::TokenTree::Group(group) => scan(group.stream()),
            _ => false,
        })
    }
    scan(ty.to_token_stream())
}

fn ensure_wrappable(sig: &Signature) -> Result<(), syn::Error> {
    if let Some(asyncness) = &sig.asyncness {
        return Err(syn::Error::new_spanned(
            asyncness,
            "#[trace] does not support `async fn`: call state is tracked per thread \
             and an async body may resume on another thread",
        ));
    }
    if let Some(constness) = &sig.constness {
        return Err(syn::Error::new_spanned(
            constness,
            "#[trace] does not support `const fn`: the tracing runtime cannot run in \
             const contexts",
        ));
    }
    Ok(())
}

fn is_wrappable(sig: &Signature) -> bool {
    sig.asyncness.is_none() && sig.constness.is_none()
}

fn has_trace_attr(attrs: &[Attribute]) -> bool {
    attrs.iter().any(|attr| {
        attr.path()
            .segments
            .last()
            .map_or(false, |segment| segment.ident == "trace")
    })
}

fn extract_type_name(ty: &Type) -> Option<String> {
    if let Type::Path(type_path) = ty {
        type_path
            .path
            .segments
            .last()
            .map(|segment| segment.ident.to_string())
    } else {
        None
    }
}
