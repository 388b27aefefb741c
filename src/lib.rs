/*!
# VidyaSphere

Backend for the VidyaSphere student application: accounts, a subject
attendance tracker, notes and previous-year-paper uploads, and PhonePe
payments for course enrollment and donations.

## Architecture

One axum server over a JSON-file database.

### HTTP layer
- **Technologies**: Rust, axum, tower-http
- Public routes: signup/signin, OTP signup, Google sign-in, uploads, payments
- Protected routes (`Authorization: Bearer <token>`): subjects and attendance

### Data layer
- `db.json` holding users (with their subjects), PYQ metadata and payment
  transactions
- Uploaded files on disk under the uploads directory, served at `/uploads`

## Attendance rules

- Percentage is `100 * attended / total`, or 0 with no classes
- "Classes needed" is the least `n` with `(attended + n) / (total + n) >= 75%`
- A subject can be marked once per 24 hours; an early mark is rejected with
  the remaining wait

## Modules

- **attendance**: subject statistics, the 24-hour mark rule and its routes
- **store**: JSON-file database
- **login**: password accounts, sessions and the auth middleware
- **otp**: phone-verified signup
- **mailer**: SMTP delivery of OTP codes
- **google**: Google OAuth sign-in
- **uploads**: PDF and PYQ uploads
- **payment**: PhonePe checkout and callback
- **app**: routing and middleware

## REST API Endpoints

- `POST /api/auth/signup`, `POST /api/auth/signin` - password accounts
- `POST /api/signup-send-otp`, `POST /api/signup-verify-otp` - OTP signup
- `GET /auth/google` - Google sign-in
- `GET|POST /api/user/subjects`, `DELETE /api/user/subjects/{id}` - subjects
- `POST /api/user/subjects/{id}/mark` - mark attendance
- `POST /api/upload-pdf`, `POST /api/upload-pyq`, `GET /api/pyqs` - files
- `POST /api/pay`, `POST /api/donate`, `POST /api/callback` - payments
*/

pub mod app;
pub mod attendance;
pub mod config;
pub mod error;
pub mod google;
pub mod login;
#[cfg(feature = "mail")]
pub mod mailer;
pub mod otp;
pub mod payment;
pub mod state;
pub mod store;
pub mod uploads;

pub use error::AppError;
pub use state::{AppState, SharedState};
