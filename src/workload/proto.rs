//! Messages of the SPIFFE Workload API `FetchX509SVID` RPC.
//!
//! Field tags follow `workload.proto` from the SPIFFE project. Only the X.509-SVID
//! messages are declared; the RPC is invoked through `tonic::client::Grpc`
//! directly in [`super::WorkloadApiClient`].

use std::collections::HashMap;

/// Fully qualified path of `SpiffeWorkloadAPI.FetchX509SVID`. The proto file
/// declares no package.
pub(crate) const FETCH_X509_SVID_PATH: &str = "/SpiffeWorkloadAPI/FetchX509SVID";

#[derive(Clone, PartialEq, ::prost::Message)]
pub(crate) struct X509SvidRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub(crate) struct X509SvidResponse {
    /// Every SVID issued to the workload; the first is the default.
    #[prost(message, repeated, tag = "1")]
    pub(crate) svids: Vec<X509Svid>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub(crate) crl: Vec<Vec<u8>>,
    /// Trust domain ID to concatenated DER authorities.
    #[prost(map = "string, bytes", tag = "3")]
    pub(crate) federated_bundles: HashMap<String, Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub(crate) struct X509Svid {
    #[prost(string, tag = "1")]
    pub(crate) spiffe_id: String,
    /// Concatenated DER chain, leaf first.
    #[prost(bytes = "vec", tag = "2")]
    pub(crate) x509_svid: Vec<u8>,
    /// PKCS#8 DER private key.
    #[prost(bytes = "vec", tag = "3")]
    pub(crate) x509_svid_key: Vec<u8>,
    /// Concatenated DER authorities of the SVID's trust domain.
    #[prost(bytes = "vec", tag = "4")]
    pub(crate) bundle: Vec<u8>,
    #[prost(string, tag = "5")]
    pub(crate) hint: String,
}
