mod backup;
mod helpers;
mod lists;
mod places;
mod sync;
mod taxonomy;
mod visits;

pub(crate) use backup::{cmd_defaults, cmd_export, cmd_import, cmd_status};
pub(crate) use lists::{
    ListArgs, cmd_list_add, cmd_list_create, cmd_list_delete, cmd_list_edit, cmd_list_list,
    cmd_list_remove, cmd_list_reorder, cmd_list_show,
};
pub(crate) use places::{
    PlaceArgs, TagAction, cmd_place_add, cmd_place_delete, cmd_place_edit, cmd_place_list,
    cmd_place_show, cmd_place_tag,
};
pub(crate) use sync::{PROBE_INTERVAL, cmd_daemon, cmd_sync};
pub(crate) use taxonomy::{
    cmd_author_set, cmd_author_show, cmd_category_add, cmd_category_delete, cmd_category_edit,
    cmd_category_list, cmd_category_reorder, cmd_tag_add, cmd_tag_delete, cmd_tag_edit,
    cmd_tag_list,
};
pub(crate) use visits::{
    DishArgs, cmd_dish_add, cmd_dish_delete, cmd_dish_edit, cmd_dish_list, cmd_visit_add,
    cmd_visit_delete, cmd_visit_edit, cmd_visit_list,
};
