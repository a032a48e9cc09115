//! Declares catalog operations whose payloads are serde JSON types

/// Define a unit struct implementing [`nn_core::Operation`] for a JSON
/// request/response pair. The closure-like tail builds the rejected
/// response from the typed request and the rejection reason.
macro_rules! json_operation {
    (
        $(#[$meta:meta])*
        $name:ident, $action:literal, $request:ty => $response:ty,
        |$req:pat_param, $reason:pat_param| $rejected:expr
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl ::nn_core::Operation for $name {
            const ACTION: &'static str = $action;
            type Request = $request;
            type Response = $response;

            fn parse_request(
                payload: &::nn_core::Payload,
            ) -> Result<$request, ::nn_core::CodecError> {
                ::nn_core::catalog::json::parse(Self::ACTION, payload)
            }

            fn request_payload(
                request: &$request,
            ) -> Result<::nn_core::Payload, ::nn_core::CodecError> {
                ::nn_core::catalog::json::payload(Self::ACTION, request)
            }

            fn parse_response(
                payload: &::nn_core::Payload,
            ) -> Result<$response, ::nn_core::CodecError> {
                ::nn_core::catalog::json::parse(Self::ACTION, payload)
            }

            fn response_payload(
                response: &$response,
            ) -> Result<::nn_core::Payload, ::nn_core::CodecError> {
                ::nn_core::catalog::json::payload(Self::ACTION, response)
            }

            fn rejected($req: &$request, $reason: &str) -> $response {
                $rejected
            }
        }
    };
}
