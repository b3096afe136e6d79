//! Fireside Reviews: review cycles, reviewer assignments, reviews,
//! calibration and release.
//!
//! | Module        | Responsibility                                          |
//! |---------------|---------------------------------------------------------|
//! | `models`      | Row types and enumerations                              |
//! | `db`          | SQLite persistence and transactional procedures          |
//! | `lifecycle`   | Review state machine, score normalization, scoring math |
//! | `cycles`      | Active-cycle resolution and labels                      |
//! | `assignments` | Desired reviewer set and deactivation plan              |
//! | `identity`    | Session tokens and the `CurrentUser` extractor          |
//! | `mailer`      | Sign-in and invitation email delivery                   |
//! | `views`       | Page view models (inbox, detail, employee home, board)  |
//! | `api`         | Shared state, error mapping, reviewer/employee routes   |
//! | `auth_api`    | Magic-link sign-in, logout, `/api/me`                   |
//! | `admin_api`   | Administrator routes                                    |
//! | `server`      | Router assembly and the HTTP server                     |

pub mod admin_api;
pub mod api;
pub mod assignments;
pub mod auth_api;
pub mod cycles;
pub mod db;
pub mod identity;
pub mod lifecycle;
pub mod mailer;
pub mod models;
pub mod server;
pub mod views;
