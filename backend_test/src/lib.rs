use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{parse_macro_input, spanned::Spanned, FnArg, ItemFn, Pat, Signature, Type};

/// Transform an asynchronous test into a synchronous one, inject dependencies,
/// and ensure that the anchoring worker is stopped regardless of how the test
/// terminates.
///
/// Injectable dependencies are [`rocket::local::asynchronous::Client`],
/// [`crate::ledger::MemLedger`], [`crate::store::MemElections`] and
/// [`crate::store::MemCredentials`]. All but the client are shared with the
/// server under test, so changes made through them are seen by the running
/// pipeline.
#[proc_macro_attribute]
pub fn backend_test(args: TokenStream, input: TokenStream) -> TokenStream {
    if !args.is_empty() {
        return syn::Error::new(
            proc_macro2::Span::call_site(),
            "`backend_test` takes no arguments",
        )
        .into_compile_error()
        .into();
    }
    let mut item_fn = parse_macro_input!(input as ItemFn);

    // Extract type information and reject invalid function signatures.
    let test_args = match check_sig(item_fn.sig.clone()) {
        Ok(args) => args,
        Err(err) => {
            return err.into_compile_error().into();
        }
    };

    // Rename the future so the test can have its original name.
    let name = item_fn.sig.ident.clone();
    let new_name = format_ident!("{}_fut", name);
    item_fn.sig.ident = new_name.clone();

    // Rewrite the test function.
    quote! {
        #[test]
        fn #name() {
            /// Test setup.
            async fn setup() -> (
                rocket::local::asynchronous::Client,
                crate::ledger::MemLedger,
                crate::store::MemElections,
                crate::store::MemCredentials,
                std::sync::Arc<crate::anchor::AnchorWorker>,
            ) {
                let ledger = crate::ledger::MemLedger::new();
                let elections = crate::store::MemElections::example();
                let credentials = crate::store::MemCredentials::new();
                let collaborators = crate::Collaborators {
                    elections: std::sync::Arc::new(elections.clone()),
                    oracle: std::sync::Arc::new(crate::oracle::StaticOracle::example()),
                    ledger: std::sync::Arc::new(ledger.clone()),
                    credentials: std::sync::Arc::new(credentials.clone()),
                    issuer_key: crate::issuer::examples::example_key(),
                };
                let rocket_client = rocket::local::asynchronous::Client::tracked(
                    crate::rocket_with(crate::test_figment(), collaborators),
                )
                .await
                .unwrap();
                let worker = rocket_client
                    .rocket()
                    .state::<std::sync::Arc<crate::anchor::AnchorWorker>>()
                    .unwrap()
                    .clone();

                (rocket_client, ledger, elections, credentials, worker)
            }

            /// The test itself.
            #item_fn

            /// Test cleanup.
            async fn cleanup(worker: std::sync::Arc<crate::anchor::AnchorWorker>) {
                worker.shutdown().await;
            }

            // Create an async runtime. We need a separate one for inside and
            // outside the `catch_unwind`.
            let outer_runtime = rocket::tokio::runtime::Builder::new_multi_thread()
                .thread_name("test-setup-cleanup")
                .worker_threads(1)
                .enable_all()
                .build()
                .unwrap();
            let inner_runtime = rocket::tokio::runtime::Builder::new_multi_thread()
                .thread_name("rocket-worker-test-thread")
                .worker_threads(1)
                .enable_all()
                .build()
                .unwrap();

            // Run the setup. The anchoring worker runs on the outer runtime.
            let (rocket_client, ledger, elections, credentials, worker) =
                outer_runtime.block_on(setup());

            // Run the test, catching any panics.
            // Use mutexes to safely transfer `!UnwindSafe` data.
            let client_mutex = std::sync::Mutex::new(rocket_client);
            let ledger_mutex = std::sync::Mutex::new(ledger);
            let elections_mutex = std::sync::Mutex::new(elections);
            let credentials_mutex = std::sync::Mutex::new(credentials);
            let runtime_mutex = std::sync::Mutex::new(inner_runtime);
            let result = std::panic::catch_unwind(|| {
                let rocket_client = client_mutex.into_inner().unwrap();
                #[allow(unused_variables)]
                let ledger = ledger_mutex.into_inner().unwrap();
                #[allow(unused_variables)]
                let elections = elections_mutex.into_inner().unwrap();
                #[allow(unused_variables)]
                let credentials = credentials_mutex.into_inner().unwrap();
                let runtime = runtime_mutex.into_inner().unwrap();

                runtime.block_on(#new_name(#(#test_args),*));
            });

            // Run the cleanup.
            outer_runtime.block_on(cleanup(worker));

            // If the test panicked, re-raise the panic.
            if let Err(cause) = result {
                std::panic::panic_any(cause);
            }
        }
    }
    .into()
}

/// Ensure the wrapped test is async, extract parameters to inject, and reject unknown parameters.
fn check_sig(sig: Signature) -> Result<Vec<TokenStream2>, syn::Error> {
    if sig.asyncness.is_none() {
        return Err(syn::Error::new(sig.span(), "Test must be marked `async`"));
    }

    let injectable = [
        ("Client", quote! { rocket_client }),
        ("MemLedger", quote! { ledger }),
        ("MemElections", quote! { elections }),
        ("MemCredentials", quote! { credentials }),
    ];
    let mut seen = vec![];
    let mut args = vec![];

    for input in &sig.inputs {
        if let FnArg::Typed(pat_type) = input {
            if let (Pat::Ident(_), Type::Path(type_path)) = (&*pat_type.pat, &*pat_type.ty) {
                if let Some(type_ident) = type_path.path.segments.last().map(|s| &s.ident) {
                    if let Some((name, arg)) =
                        injectable.iter().find(|(name, _)| type_ident == name)
                    {
                        if seen.contains(name) {
                            return Err(syn::Error::new(
                                input.span(),
                                format!("Test cannot accept more than one `{name}`"),
                            ));
                        }
                        seen.push(*name);
                        args.push(arg.clone());
                        continue;
                    }
                }
            }
        }

        return Err(syn::Error::new(
            input.span(),
            "Expected one of `client_ident: Client`, `ledger_ident: MemLedger`, \
             `elections_ident: MemElections` or `credentials_ident: MemCredentials`",
        ));
    }

    Ok(args)
}
