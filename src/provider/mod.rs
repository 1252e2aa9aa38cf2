//! Scheduling/payments provider client
//!
//! The sweep only needs two calls: list bookings in a window (paginated) and
//! list the resource profiles bookings are queried by. [`ProviderClient`] is
//! the seam; [`HttpProviderClient`] is the production implementation.

pub mod http;
pub mod types;

use async_trait::async_trait;

use crate::error::ProviderError;

pub use http::HttpProviderClient;
pub use types::{
    AppointmentSegment, BookingPage, BookingQuery, ExternalBooking, ExternalCheckout,
    ExternalInvoice, ExternalPayment, Money, RejectedBooking, ResourceProfile,
};

/// Read access to the provider's bookings API
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// One page of bookings in `query.window`; pass the previous page's token to continue
    async fn list_bookings_in_window(
        &self,
        query: &BookingQuery,
        page_token: Option<&str>,
    ) -> Result<BookingPage, ProviderError>;

    /// All resource profiles bookings can be attached to
    async fn list_resource_profiles(&self) -> Result<Vec<ResourceProfile>, ProviderError>;
}
