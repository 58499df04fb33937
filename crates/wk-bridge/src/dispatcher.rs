//! Command dispatch.
//!
//! A static table maps integer api codes (partitioned by thousands per
//! domain) onto method tags; dispatch instantiates the owning service with
//! the caller's user number and runs the method. Write methods run under
//! the caller's user lock for their whole duration, which is what
//! serializes a user's commands against each other and against timed-task
//! completions.

use std::sync::Arc;

use axum::http::StatusCode;
use serde_json::json;

use wk_core::{GameError, GameResult};
use wk_game::alliance::AllianceService;
use wk_game::buff::BuffService;
use wk_game::building::BuildingService;
use wk_game::item::ItemService;
use wk_game::login::LoginOrchestrator;
use wk_game::mission::MissionService;
use wk_game::research::ResearchService;
use wk_game::resource::ResourceService;
use wk_game::shop::ShopService;
use wk_game::unit::UnitService;
use wk_game::Deps;

use crate::protocol::{ApiRequest, ApiResponse};

/// Method tags, one per routable api code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiMethod {
    // 1xxx — system
    GetConfigs,
    Login,
    ResourceInfo,
    // 2xxx — building
    BuildingInfo,
    BuildingCreate,
    BuildingLevelup,
    BuildingCancel,
    BuildingSpeedup,
    // 3xxx — research
    ResearchInfo,
    ResearchStart,
    ResearchCancel,
    ResearchInstant,
    // 4xxx — unit
    UnitInfo,
    UnitTrain,
    UnitUpgrade,
    UnitCancel,
    UnitSpeedup,
    // 5xxx — item
    ItemInfo,
    ItemUse,
    ItemDetail,
    ItemAdd,
    // 6xxx — mission
    MissionInfo,
    MissionDetail,
    MissionClaim,
    // 7xxx — alliance
    AllianceInfo,
    AllianceCreate,
    AllianceJoin,
    AllianceLeave,
    AllianceSearch,
    AllianceMembers,
    AllianceKick,
    AlliancePromote,
    AllianceApplications,
    AllianceApprove,
    AllianceDonate,
    AllianceSetJoinPolicy,
    AllianceDisband,
    // 8xxx — shop
    ShopInfo,
    ShopRefresh,
    ShopBuy,
    // 9xxx — buff
    BuffInfo,
    BuffActivate,
    BuffCancel,
}

/// Resolve an api code to its method tag.
pub fn route(api_code: i64) -> Option<ApiMethod> {
    use ApiMethod::*;
    Some(match api_code {
        1001 => GetConfigs,
        1010 => Login,
        1011 => ResourceInfo,

        2001 => BuildingInfo,
        2002 => BuildingCreate,
        2003 => BuildingLevelup,
        2005 => BuildingCancel,
        2006 => BuildingSpeedup,

        3001 => ResearchInfo,
        3002 => ResearchStart,
        3004 => ResearchCancel,
        3005 => ResearchInstant,

        4001 => UnitInfo,
        4002 => UnitTrain,
        4003 => UnitUpgrade,
        4005 => UnitCancel,
        4006 => UnitSpeedup,

        5001 => ItemInfo,
        5002 => ItemUse,
        5003 => ItemDetail,
        5004 => ItemAdd,

        6001 => MissionInfo,
        6002 => MissionDetail,
        6003 => MissionClaim,

        7001 => AllianceInfo,
        7002 => AllianceCreate,
        7003 => AllianceJoin,
        7004 => AllianceLeave,
        7005 => AllianceSearch,
        7006 => AllianceMembers,
        7007 => AllianceKick,
        7008 => AlliancePromote,
        7009 => AllianceApplications,
        7010 => AllianceApprove,
        7011 => AllianceDonate,
        7012 => AllianceSetJoinPolicy,
        7013 => AllianceDisband,

        8001 => ShopInfo,
        8002 => ShopRefresh,
        8003 => ShopBuy,

        9001 => BuffInfo,
        9002 => BuffActivate,
        9003 => BuffCancel,

        _ => return None,
    })
}

impl ApiMethod {
    /// Whether the method mutates state and therefore needs the user lock.
    /// Login warms caches and may create the user; the shop's first info
    /// rolls slots — both count as writes.
    pub fn is_write(&self) -> bool {
        use ApiMethod::*;
        !matches!(
            self,
            GetConfigs
                | ResourceInfo
                | BuildingInfo
                | ResearchInfo
                | UnitInfo
                | ItemInfo
                | ItemDetail
                | MissionInfo
                | MissionDetail
                | AllianceInfo
                | AllianceSearch
                | AllianceMembers
                | AllianceApplications
                | BuffInfo
        )
    }
}

/// HTTP status for an error kind. Success is always 200; only
/// `TransientBackend` and `Fatal` surface as 5xx. A lock timeout is
/// contention on the caller's own state, not a server fault, so it maps
/// to 429 and the client simply retries.
pub fn status_for(err: &GameError) -> StatusCode {
    match err {
        GameError::Validation(_) => StatusCode::BAD_REQUEST,
        GameError::NotFound(_) => StatusCode::NOT_FOUND,
        GameError::Conflict(_) | GameError::InsufficientResources(_) => StatusCode::CONFLICT,
        GameError::Forbidden(_) => StatusCode::FORBIDDEN,
        GameError::LockTimeout(_) => StatusCode::TOO_MANY_REQUESTS,
        GameError::TransientBackend(_) => StatusCode::SERVICE_UNAVAILABLE,
        GameError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Route, lock, and execute one command.
pub async fn dispatch(deps: &Arc<Deps>, req: &ApiRequest) -> (StatusCode, ApiResponse) {
    match execute(deps, req).await {
        Ok(data) => (StatusCode::OK, ApiResponse::ok("ok", data)),
        Err(err) => {
            if err.is_internal() {
                tracing::error!(
                    user_no = req.user_no,
                    api_code = req.api_code,
                    error = %err,
                    "command failed"
                );
            } else {
                tracing::debug!(
                    user_no = req.user_no,
                    api_code = req.api_code,
                    error = %err,
                    "command rejected"
                );
            }
            (status_for(&err), ApiResponse::error(&err))
        }
    }
}

async fn execute(deps: &Arc<Deps>, req: &ApiRequest) -> GameResult<serde_json::Value> {
    let method = route(req.api_code)
        .ok_or_else(|| GameError::Validation(format!("unknown api code {}", req.api_code)))?;
    if req.user_no <= 0 {
        return Err(GameError::Validation("user_no must be positive".into()));
    }

    // Commands from a single user serialize on this lock; completions for
    // the same user contend on it too.
    let _guard = if method.is_write() {
        Some(deps.locks.lock_user(req.user_no).await?)
    } else {
        None
    };

    let user_no = req.user_no;
    let data = &req.data;
    use ApiMethod::*;
    match method {
        GetConfigs => Ok(json!({ "configs": &*deps.catalog })),
        Login => {
            LoginOrchestrator::new(deps.clone(), user_no)
                .handle_login(data)
                .await
        }
        ResourceInfo => ResourceService::new(deps.clone(), user_no).info().await,

        BuildingInfo => BuildingService::new(deps.clone(), user_no).info().await,
        BuildingCreate => BuildingService::new(deps.clone(), user_no).create(data).await,
        BuildingLevelup => {
            BuildingService::new(deps.clone(), user_no)
                .levelup(data)
                .await
        }
        BuildingCancel => BuildingService::new(deps.clone(), user_no).cancel(data).await,
        BuildingSpeedup => {
            BuildingService::new(deps.clone(), user_no)
                .speedup(data)
                .await
        }

        ResearchInfo => ResearchService::new(deps.clone(), user_no).info().await,
        ResearchStart => ResearchService::new(deps.clone(), user_no).start(data).await,
        ResearchCancel => ResearchService::new(deps.clone(), user_no).cancel(data).await,
        ResearchInstant => {
            ResearchService::new(deps.clone(), user_no)
                .instant_complete(data)
                .await
        }

        UnitInfo => UnitService::new(deps.clone(), user_no).info().await,
        UnitTrain => UnitService::new(deps.clone(), user_no).train(data).await,
        UnitUpgrade => UnitService::new(deps.clone(), user_no).upgrade(data).await,
        UnitCancel => UnitService::new(deps.clone(), user_no).cancel(data).await,
        UnitSpeedup => UnitService::new(deps.clone(), user_no).speedup(data).await,

        ItemInfo => ItemService::new(deps.clone(), user_no).info().await,
        ItemUse => ItemService::new(deps.clone(), user_no).use_item(data).await,
        ItemDetail => ItemService::new(deps.clone(), user_no).detail(data).await,
        ItemAdd => ItemService::new(deps.clone(), user_no).add(data).await,

        MissionInfo => MissionService::new(deps.clone(), user_no).info().await,
        MissionDetail => MissionService::new(deps.clone(), user_no).detail(data).await,
        MissionClaim => MissionService::new(deps.clone(), user_no).claim(data).await,

        AllianceInfo => AllianceService::new(deps.clone(), user_no).info(data).await,
        AllianceCreate => AllianceService::new(deps.clone(), user_no).create(data).await,
        AllianceJoin => AllianceService::new(deps.clone(), user_no).join(data).await,
        AllianceLeave => AllianceService::new(deps.clone(), user_no).leave().await,
        AllianceSearch => AllianceService::new(deps.clone(), user_no).search(data).await,
        AllianceMembers => AllianceService::new(deps.clone(), user_no).member_list().await,
        AllianceKick => AllianceService::new(deps.clone(), user_no).kick(data).await,
        AlliancePromote => {
            AllianceService::new(deps.clone(), user_no)
                .promote(data)
                .await
        }
        AllianceApplications => {
            AllianceService::new(deps.clone(), user_no)
                .application_list()
                .await
        }
        AllianceApprove => {
            AllianceService::new(deps.clone(), user_no)
                .approve(data)
                .await
        }
        AllianceDonate => AllianceService::new(deps.clone(), user_no).donate(data).await,
        AllianceSetJoinPolicy => {
            AllianceService::new(deps.clone(), user_no)
                .set_join_policy(data)
                .await
        }
        AllianceDisband => AllianceService::new(deps.clone(), user_no).disband().await,

        ShopInfo => ShopService::new(deps.clone(), user_no).info().await,
        ShopRefresh => ShopService::new(deps.clone(), user_no).refresh().await,
        ShopBuy => ShopService::new(deps.clone(), user_no).buy(data).await,

        BuffInfo => BuffService::new(deps.clone(), user_no).info().await,
        BuffActivate => BuffService::new(deps.clone(), user_no).activate(data).await,
        BuffCancel => BuffService::new(deps.clone(), user_no).cancel(data).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wk_core::catalog::GameCatalog;
    use wk_core::config::ServerConfig;

    #[test]
    fn codes_partition_by_thousands() {
        assert_eq!(route(1010), Some(ApiMethod::Login));
        assert_eq!(route(2002), Some(ApiMethod::BuildingCreate));
        assert_eq!(route(3002), Some(ApiMethod::ResearchStart));
        assert_eq!(route(4002), Some(ApiMethod::UnitTrain));
        assert_eq!(route(7011), Some(ApiMethod::AllianceDonate));
        assert_eq!(route(8003), Some(ApiMethod::ShopBuy));
        assert_eq!(route(1), None);
        assert_eq!(route(2004), None);
    }

    #[test]
    fn only_backend_failures_are_5xx() {
        assert_eq!(
            status_for(&GameError::LockTimeout("user:1".into())),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_for(&GameError::TransientBackend("db".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&GameError::Fatal("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert!(!status_for(&GameError::LockTimeout("user:1".into())).is_server_error());
    }

    #[test]
    fn reads_skip_the_user_lock() {
        assert!(!ApiMethod::BuildingInfo.is_write());
        assert!(!ApiMethod::GetConfigs.is_write());
        assert!(ApiMethod::BuildingCreate.is_write());
        assert!(ApiMethod::Login.is_write());
        assert!(ApiMethod::ShopInfo.is_write());
    }

    #[tokio::test]
    async fn unknown_code_is_a_validation_error() {
        let deps = Deps::in_memory(GameCatalog::default(), ServerConfig::default())
            .await
            .unwrap();
        let req = ApiRequest {
            user_no: 1,
            api_code: 9999,
            data: json!({}),
        };
        let (status, resp) = dispatch(&deps, &req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!resp.success);
        assert!(resp.message.contains("9999"));
    }

    #[tokio::test]
    async fn login_then_resource_info() {
        let deps = Deps::in_memory(GameCatalog::default(), ServerConfig::default())
            .await
            .unwrap();
        let (status, resp) = dispatch(
            &deps,
            &ApiRequest {
                user_no: 1001,
                api_code: 1010,
                data: json!({}),
            },
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(resp.success);

        let (status, resp) = dispatch(
            &deps,
            &ApiRequest {
                user_no: 1001,
                api_code: 1011,
                data: json!({}),
            },
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resp.data["resources"]["food"], 5000);
    }

    #[tokio::test]
    async fn conflict_maps_to_409() {
        let deps = Deps::in_memory(GameCatalog::default(), ServerConfig::default())
            .await
            .unwrap();
        dispatch(
            &deps,
            &ApiRequest {
                user_no: 1,
                api_code: 1010,
                data: json!({}),
            },
        )
        .await;
        // Leaving an alliance without being in one.
        let (status, resp) = dispatch(
            &deps,
            &ApiRequest {
                user_no: 1,
                api_code: 7004,
                data: json!({}),
            },
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(!resp.success);
    }
}
