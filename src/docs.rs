// src/docs.rs

use utoipa::openapi::security::{Http, HttpAuthScheme, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::handlers;
use crate::models;

#[derive(OpenApi)]
#[openapi(
    paths(
        // --- Auth ---
        handlers::auth::register,
        handlers::auth::login,

        // --- Users ---
        handlers::auth::get_me,

        // --- Staff ---
        handlers::staff::create_staff,
    ),
    components(
        schemas(
            // --- Auth ---
            models::auth::Role,
            models::auth::Profile,
            models::auth::ProfileView,
            models::auth::Principal,
            models::auth::RegisterUserPayload,
            models::auth::LoginUserPayload,
            models::auth::AuthResponse,
            models::auth::SignupResponse,
            models::auth::UpdateProfilePayload,
            models::auth::ChangePasswordPayload,

            // --- Shops ---
            models::shops::Shop,
            models::shops::CreateShopInput,
            models::shops::UpdateShopInput,

            // --- Vehicles ---
            models::vehicles::VehicleType,
            models::vehicles::Vehicle,
            models::vehicles::VehicleView,
            models::vehicles::CreateVehicleInput,
            models::vehicles::UpdateVehicleInput,

            // --- Bookings ---
            models::bookings::BookingStatus,
            models::bookings::DeliveryStatus,
            models::bookings::Booking,
            models::bookings::BookingView,
            models::bookings::VehicleSummary,
            models::bookings::ShopSummary,
            models::bookings::CustomerSummary,
            models::bookings::CreateBookingInput,
            models::bookings::UpdateBookingInput,

            // --- Staff ---
            models::staff::Staff,
            models::staff::StaffView,
            models::staff::CreateStaffPayload,
            models::staff::CreateStaffResponse,
            models::staff::UpdateStaffInput,

            // --- Saved shops ---
            models::saved_shops::SavedShop,
            models::saved_shops::SavedShopView,
            models::saved_shops::ToggleSavedResult,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "auth", description = "Registro e login"),
        (name = "users", description = "O principal autenticado"),
        (name = "staff", description = "Provisionamento privilegiado de staff"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
        }
    }
}
